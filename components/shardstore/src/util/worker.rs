//! `Worker` provides a mechanism to run tasks asynchronously (i.e. in the
//! background) on a dedicated thread.
//!
//! A worker contains:
//!
//! - A runner (which should implement the `Runnable` trait): to run tasks
//!   one by one.
//! - A scheduler: to send tasks to the runner, returns immediately.
//!
//! Briefly speaking, this is a mpsc (multiple-producer-single-consumer)
//! model.

use std::fmt::{self, Debug, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{Builder as ThreadBuilder, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};

#[derive(Eq, PartialEq)]
pub enum ScheduleError<T> {
    Stopped(T),
    Full(T),
}

impl<T> ScheduleError<T> {
    pub fn into_inner(self) -> T {
        match self {
            ScheduleError::Stopped(t) | ScheduleError::Full(t) => t,
        }
    }
}

impl<T> Display for ScheduleError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let msg = match *self {
            ScheduleError::Stopped(_) => "channel has been closed",
            ScheduleError::Full(_) => "channel is full",
        };
        write!(f, "{}", msg)
    }
}

impl<T> Debug for ScheduleError<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)
    }
}

pub trait Runnable<T: Display> {
    /// Runs a task.
    fn run(&mut self, task: T);

    fn shutdown(&mut self) {}
}

/// Schedules tasks to the associated runner; cheap to clone.
pub struct Scheduler<T> {
    counter: Arc<AtomicUsize>,
    sender: Sender<Option<T>>,
}

impl<T: Display + Send + 'static> Scheduler<T> {
    /// Schedules a task to run. If the worker is stopped, an error will
    /// return.
    pub fn schedule(&self, task: T) -> Result<(), ScheduleError<T>> {
        if let Err(e) = self.sender.try_send(Some(task)) {
            match e {
                TrySendError::Disconnected(t) => {
                    return Err(ScheduleError::Stopped(t.unwrap()));
                }
                TrySendError::Full(t) => return Err(ScheduleError::Full(t.unwrap())),
            }
        }
        self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Checks if the underlying worker can't handle a task immediately.
    pub fn is_busy(&self) -> bool {
        self.counter.load(Ordering::SeqCst) > 0
    }
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Scheduler<T> {
        Scheduler {
            counter: Arc::clone(&self.counter),
            sender: self.sender.clone(),
        }
    }
}

/// A worker that runs tasks on a single dedicated thread.
pub struct Worker<T: Display + Send + 'static> {
    name: String,
    scheduler: Scheduler<T>,
    receiver: Mutex<Option<Receiver<Option<T>>>>,
    handle: Option<JoinHandle<()>>,
}

impl<T: Display + Send + 'static> Worker<T> {
    pub fn new(name: impl Into<String>) -> Worker<T> {
        let (tx, rx) = channel::unbounded();
        Worker {
            name: name.into(),
            scheduler: Scheduler {
                counter: Arc::new(AtomicUsize::new(0)),
                sender: tx,
            },
            receiver: Mutex::new(Some(rx)),
            handle: None,
        }
    }

    /// Starts the worker with the given runner.
    pub fn start<R>(&mut self, mut runner: R) -> Result<(), std::io::Error>
    where
        R: Runnable<T> + Send + 'static,
    {
        let receiver = match self.receiver.lock().unwrap().take() {
            Some(r) => r,
            None => return Ok(()),
        };
        let counter = Arc::clone(&self.scheduler.counter);
        let h = ThreadBuilder::new()
            .name(self.name.clone())
            .spawn(move || {
                while let Ok(msg) = receiver.recv() {
                    match msg {
                        Some(task) => {
                            runner.run(task);
                            counter.fetch_sub(1, Ordering::SeqCst);
                        }
                        None => break,
                    }
                }
                runner.shutdown();
            })?;
        self.handle = Some(h);
        Ok(())
    }

    pub fn scheduler(&self) -> Scheduler<T> {
        self.scheduler.clone()
    }

    pub fn schedule(&self, task: T) -> Result<(), ScheduleError<T>> {
        self.scheduler.schedule(task)
    }

    /// Stops the worker thread and waits for it to finish outstanding
    /// tasks.
    pub fn stop(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = self.scheduler.sender.send(None);
            let _ = h.join();
        }
    }
}

impl<T: Display + Send + 'static> Drop for Worker<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    struct StepRunner {
        ch: mpsc::Sender<u64>,
    }

    impl Runnable<u64> for StepRunner {
        fn run(&mut self, step: u64) {
            self.ch.send(step).unwrap();
        }

        fn shutdown(&mut self) {
            self.ch.send(0).unwrap();
        }
    }

    #[test]
    fn test_worker() {
        let mut worker = Worker::new("test-worker");
        let (tx, rx) = mpsc::channel();
        worker.start(StepRunner { ch: tx }).unwrap();
        worker.schedule(60).unwrap();
        worker.schedule(40).unwrap();
        worker.schedule(50).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), 60);
        assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), 40);
        assert_eq!(rx.recv_timeout(Duration::from_secs(3)).unwrap(), 50);
        worker.stop();
        // when shutdown, StepRunner should send back a 0.
        assert_eq!(0, rx.recv().unwrap());
        assert!(worker.schedule(1).is_err());
    }
}
