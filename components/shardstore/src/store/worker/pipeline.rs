//! The per-shard job pipeline.
//!
//! All asynchronous work of a shard — applying entries, installing and
//! generating snapshots, registering proposals, log GC, destruction —
//! runs as jobs on a shared pool of apply workers. Jobs are routed by
//! shard id to a fixed worker, so jobs of one shard are strictly
//! serialized while different shards proceed in parallel. Destruction is
//! terminal: once a shard's destroy job ran, later jobs for it are
//! rejected.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use engine_traits::{Engines, KvEngine, MiscExt, Mutable, WriteBatchExt};
use prost::Message;
use raft::eraftpb::{Entry, Snapshot};
use slog::{error, info, warn, Logger};

use crate::errors::Result;
use crate::keys;
use crate::metapb::Shard;
use crate::raftpb::{ApplyState, PeerState, ShardLocalState, SnapshotHeader};
use crate::store::apply::{
    notify_req_shard_removed, ApplyContext, ApplyDelegate, PendingCmd, Registration,
};
use crate::store::msg::PeerMsg;
use crate::store::router::Router;
use crate::store::shard_state::{
    GenSnapTask, JOB_STATUS_CANCELLED, JOB_STATUS_CANCELLING, JOB_STATUS_FAILED,
    JOB_STATUS_FINISHED, JOB_STATUS_PENDING, JOB_STATUS_RUNNING,
};
use crate::store::snap::{SnapEntry, SnapKey, SnapManager};
use crate::store::util;
use crate::util::worker::{Runnable, Worker};

pub enum Job {
    /// (Re-)register the shard's apply delegate.
    Registration(Registration),
    ApplyEntries {
        shard_id: u64,
        term: u64,
        entries: Vec<Entry>,
    },
    Propose {
        shard_id: u64,
        cmd: PendingCmd,
        is_change_peer: bool,
    },
    GenerateSnapshot {
        shard_id: u64,
        task: GenSnapTask,
    },
    ApplySnapshot {
        shard_id: u64,
        status: Arc<AtomicUsize>,
        /// Which artifact to install. `None` on crash recovery, where it
        /// is re-derived from the persisted states.
        snap_key: Option<SnapKey>,
        /// Encoded data ranges to clear before ingesting.
        clear_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    },
    RaftLogGC {
        shard_id: u64,
        start_index: u64,
        end_index: u64,
    },
    Destroy {
        shard_id: u64,
        peer_id: u64,
        /// Set when the range moved to a merge target; its data must
        /// survive.
        keep_data: bool,
    },
}

impl Job {
    pub fn shard_id(&self) -> u64 {
        match self {
            Job::Registration(reg) => reg.shard.id,
            Job::ApplyEntries { shard_id, .. }
            | Job::Propose { shard_id, .. }
            | Job::GenerateSnapshot { shard_id, .. }
            | Job::ApplySnapshot { shard_id, .. }
            | Job::RaftLogGC { shard_id, .. }
            | Job::Destroy { shard_id, .. } => *shard_id,
        }
    }
}

impl Display for Job {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Job::Registration(reg) => write!(f, "registration [shard {}]", reg.shard.id),
            Job::ApplyEntries {
                shard_id, entries, ..
            } => write!(f, "apply {} entries [shard {}]", entries.len(), shard_id),
            Job::Propose { shard_id, cmd, .. } => write!(
                f,
                "propose at index {} term {} [shard {}]",
                cmd.index, cmd.term, shard_id
            ),
            Job::GenerateSnapshot { shard_id, .. } => {
                write!(f, "generate snapshot [shard {}]", shard_id)
            }
            Job::ApplySnapshot { shard_id, .. } => write!(f, "apply snapshot [shard {}]", shard_id),
            Job::RaftLogGC {
                shard_id,
                start_index,
                end_index,
            } => write!(
                f,
                "raft log gc [{}, {}) [shard {}]",
                start_index, end_index, shard_id
            ),
            Job::Destroy { shard_id, .. } => write!(f, "destroy [shard {}]", shard_id),
        }
    }
}

/// Runs the jobs of the shards routed to one worker thread.
pub struct ApplyRunner<E: KvEngine> {
    store_id: u64,
    engines: Engines<E>,
    snap_mgr: SnapManager,
    router: Router,
    delegates: HashMap<u64, ApplyDelegate>,
    destroyed: Arc<Mutex<HashSet<u64>>>,
    logger: Logger,
}

impl<E: KvEngine> ApplyRunner<E> {
    fn new(
        store_id: u64,
        engines: Engines<E>,
        snap_mgr: SnapManager,
        router: Router,
        destroyed: Arc<Mutex<HashSet<u64>>>,
        logger: Logger,
    ) -> ApplyRunner<E> {
        ApplyRunner {
            store_id,
            engines,
            snap_mgr,
            router,
            delegates: HashMap::new(),
            destroyed,
            logger,
        }
    }

    fn handle_registration(&mut self, reg: Registration) {
        let shard_id = reg.shard.id;
        let delegate = ApplyDelegate::from_registration(reg);
        if let Some(mut old) = self.delegates.insert(shard_id, delegate) {
            old.clear_all_commands_as_stale(&self.logger);
        }
    }

    fn handle_apply_entries(&mut self, shard_id: u64, term: u64, entries: Vec<Entry>) {
        // Once the replica entered Applying, a pending snapshot owns the
        // shard's state; stale entry batches must not touch it.
        match self
            .engines
            .meta
            .get_msg::<ShardLocalState>(&keys::local_state_key(shard_id))
        {
            Ok(Some(state)) if state.state() == PeerState::Applying => {
                info!(
                    self.logger,
                    "skip applying entries, snapshot pending";
                    "shard_id" => shard_id,
                );
                return;
            }
            _ => {}
        }
        let delegate = match self.delegates.get_mut(&shard_id) {
            Some(d) if !d.is_stopped() => d,
            _ => {
                warn!(
                    self.logger,
                    "apply entries for missing delegate";
                    "shard_id" => shard_id,
                );
                return;
            }
        };
        let mut ctx = ApplyContext::new(self.store_id, &self.engines, &self.logger);
        delegate.handle_raft_committed_entries(&mut ctx, term, entries);
        let res = ctx.finish_for(delegate);
        let _ = self.router.send_peer(shard_id, PeerMsg::ApplyRes(res));
    }

    fn handle_propose(&mut self, shard_id: u64, cmd: PendingCmd, is_change_peer: bool) {
        let delegate = match self.delegates.get_mut(&shard_id) {
            Some(d) if !d.is_stopped() => d,
            _ => {
                if let Some(cb) = cmd.into_callback() {
                    notify_req_shard_removed(shard_id, cb);
                }
                return;
            }
        };
        delegate.sweep_timeouts(std::time::Instant::now());
        if is_change_peer {
            delegate.set_pending_change_peer(cmd, &self.logger);
        } else {
            delegate.append_pending(cmd);
        }
    }

    /// The leader-side snapshot build, see the generate-snapshot
    /// protocol: derive the term of the applied index, refuse non-Normal
    /// replicas, register as Creating and build the artifact.
    fn handle_generate_snapshot(&mut self, shard_id: u64, task: GenSnapTask) -> Result<()> {
        let apply_state: ApplyState = match self
            .engines
            .meta
            .get_msg(&keys::apply_state_key(shard_id))?
        {
            Some(s) => s,
            None => panic!("[shard {}] could not load apply state for snapshot", shard_id),
        };

        let index = apply_state.applied_index;
        let term = if index == apply_state.truncated().index {
            apply_state.truncated().term
        } else {
            crate::store::shard_state::load_log_entry(&self.engines, shard_id, index)?.get_term()
        };

        let local_state: ShardLocalState = match self
            .engines
            .meta
            .get_msg(&keys::local_state_key(shard_id))?
        {
            Some(s) => s,
            None => panic!("[shard {}] could not load local state for snapshot", shard_id),
        };
        if local_state.state() != PeerState::Normal {
            error!(
                self.logger,
                "snap seems stale, skip";
                "shard_id" => shard_id,
                "state" => ?local_state.state(),
            );
            return Ok(());
        }
        let shard = local_state.shard().clone();

        let header = SnapshotHeader {
            shard: Some(shard.clone()),
            term,
            index,
        };
        let key = SnapKey::new(shard_id, term, index);

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().set_index(index);
        snapshot.mut_metadata().set_term(term);
        snapshot
            .mut_metadata()
            .set_conf_state(util::conf_state_from_shard(&shard));

        if self.snap_mgr.register(key, SnapEntry::Creating) {
            let res = self.snap_mgr.create(
                &key,
                &self.engines.data.snapshot(),
                &keys::enc_start_key(&shard),
                &keys::enc_end_key(&shard),
            );
            self.snap_mgr.deregister(&key, SnapEntry::Creating);
            if let Err(e) = res {
                error!(
                    self.logger,
                    "create snapshot artifact failed";
                    "shard_id" => shard_id,
                    "err" => %e,
                );
                return Err(e);
            }
        }

        snapshot.set_data(header.encode_to_vec().into());

        if task.canceled.load(Ordering::SeqCst) {
            return Ok(());
        }
        let _ = task.notifier.try_send(snapshot);
        let _ = self.router.send_peer(shard_id, PeerMsg::SnapshotGenerated);
        info!(
            self.logger,
            "snapshot created";
            "shard_id" => shard_id,
            "term" => term,
            "index" => index,
        );
        Ok(())
    }

    fn handle_apply_snapshot(
        &mut self,
        shard_id: u64,
        status: Arc<AtomicUsize>,
        snap_key: Option<SnapKey>,
        clear_ranges: Vec<(Vec<u8>, Vec<u8>)>,
    ) -> Result<()> {
        if status
            .compare_exchange(
                JOB_STATUS_PENDING,
                JOB_STATUS_RUNNING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            // Cancelled before it ever ran.
            status.store(JOB_STATUS_CANCELLED, Ordering::SeqCst);
            let _ = self
                .router
                .send_peer(shard_id, PeerMsg::SnapshotApplied { success: false });
            return Ok(());
        }

        let abort = {
            let status = status.clone();
            move || status.load(Ordering::SeqCst) == JOB_STATUS_CANCELLING
        };

        let local_state: ShardLocalState = match self
            .engines
            .meta
            .get_msg(&keys::local_state_key(shard_id))?
        {
            Some(s) => s,
            None => panic!("[shard {}] missing local state while applying snapshot", shard_id),
        };
        assert_eq!(local_state.state(), PeerState::Applying);
        let shard = local_state.shard().clone();
        let key = match snap_key {
            Some(key) => key,
            None => {
                // Crash recovery: re-derive from the persisted states,
                // falling back to whatever artifact exists for the shard.
                let apply_state: ApplyState = self
                    .engines
                    .meta
                    .get_msg(&keys::apply_state_key(shard_id))?
                    .unwrap_or_default();
                let derived =
                    SnapKey::new(shard_id, apply_state.applied_term, apply_state.applied_index);
                if self.snap_mgr.exists(&derived) {
                    derived
                } else {
                    self.snap_mgr
                        .latest_for_shard(shard_id)
                        .unwrap_or(derived)
                }
            }
        };

        for (start, end) in &clear_ranges {
            self.engines.data.delete_all_in_range(start, end)?;
        }
        if abort() {
            status.store(JOB_STATUS_CANCELLED, Ordering::SeqCst);
            let _ = self
                .router
                .send_peer(shard_id, PeerMsg::SnapshotApplied { success: false });
            return Ok(());
        }

        self.snap_mgr.register(key, SnapEntry::Applying);
        let ingested = self.snap_mgr.apply(&key, &self.engines.data, abort);
        self.snap_mgr.deregister(&key, SnapEntry::Applying);
        let ingested = match ingested {
            Ok(done) => done,
            Err(e) => {
                error!(
                    self.logger,
                    "apply snapshot failed";
                    "shard_id" => shard_id,
                    "err" => %e,
                );
                status.store(JOB_STATUS_FAILED, Ordering::SeqCst);
                let _ = self
                    .router
                    .send_peer(shard_id, PeerMsg::SnapshotApplied { success: false });
                return Err(e);
            }
        };
        if !ingested {
            status.store(JOB_STATUS_CANCELLED, Ordering::SeqCst);
            let _ = self
                .router
                .send_peer(shard_id, PeerMsg::SnapshotApplied { success: false });
            return Ok(());
        }

        // The replica leaves Applying only after all data landed; the
        // apply state is rewritten in the same batch so a stale entry
        // round cannot leave it behind the snapshot position.
        let apply_state = ApplyState {
            applied_index: key.index,
            applied_term: key.term,
            truncated: Some(crate::raftpb::TruncatedState {
                index: key.index,
                term: key.term,
            }),
        };
        let mut wb = self.engines.meta.write_batch();
        wb.put_msg(&keys::apply_state_key(shard_id), &apply_state)?;
        crate::store::apply::write_shard_state(&mut wb, &shard, PeerState::Normal, "apply-snap");
        self.engines
            .meta
            .write_opt(&wb, &engine_traits::WriteOptions { sync: true })?;

        status.store(JOB_STATUS_FINISHED, Ordering::SeqCst);
        let _ = self
            .router
            .send_peer(shard_id, PeerMsg::SnapshotApplied { success: true });
        info!(
            self.logger,
            "snapshot applied";
            "shard_id" => shard_id,
            "index" => apply_state.applied_index,
        );
        Ok(())
    }

    fn handle_raft_log_gc(&mut self, shard_id: u64, start_index: u64, end_index: u64) -> Result<()> {
        let mut wb = self.engines.meta.write_batch();
        for idx in start_index..end_index {
            wb.delete(&keys::raft_log_key(shard_id, idx))?;
        }
        self.engines.meta.write(&wb)?;
        Ok(())
    }

    fn handle_destroy(&mut self, shard_id: u64, peer_id: u64, keep_data: bool) -> Result<()> {
        if let Some(mut delegate) = self.delegates.remove(&shard_id) {
            delegate.notify_destroyed(&self.logger);
        }

        let local_state: Option<ShardLocalState> =
            self.engines.meta.get_msg(&keys::local_state_key(shard_id))?;
        let shard = local_state
            .as_ref()
            .map(|s| s.shard().clone())
            .unwrap_or_else(|| Shard {
                id: shard_id,
                ..Default::default()
            });

        // Tombstone first: should we crash mid-destroy, restart must not
        // revive the replica.
        let mut wb = self.engines.meta.write_batch();
        crate::store::apply::write_shard_state(&mut wb, &shard, PeerState::Tombstone, "destroy");
        self.engines
            .meta
            .write_opt(&wb, &engine_traits::WriteOptions { sync: true })?;

        // Log, then data, then the remaining bookkeeping.
        self.engines.meta.delete_all_in_range(
            &keys::raft_log_prefix(shard_id),
            &keys::raft_log_prefix_end(shard_id),
        )?;
        if !keep_data && util::is_shard_initialized(&shard) {
            self.engines
                .data
                .delete_all_in_range(&keys::enc_start_key(&shard), &keys::enc_end_key(&shard))?;
        }
        let mut wb = self.engines.meta.write_batch();
        wb.delete(&keys::apply_state_key(shard_id))?;
        wb.delete(&keys::hard_state_key(shard_id))?;
        self.engines.meta.write(&wb)?;

        self.destroyed.lock().unwrap().insert(shard_id);
        let _ = self
            .router
            .send_peer(shard_id, PeerMsg::DestroyRes { merged: keep_data });
        info!(
            self.logger,
            "replica destroyed";
            "shard_id" => shard_id,
            "peer_id" => peer_id,
            "keep_data" => keep_data,
        );
        Ok(())
    }
}

impl<E: KvEngine> Runnable<Job> for ApplyRunner<E> {
    fn run(&mut self, job: Job) {
        let shard_id = job.shard_id();
        if self.destroyed.lock().unwrap().contains(&shard_id) {
            if let Job::Propose { cmd, .. } = job {
                if let Some(cb) = cmd.into_callback() {
                    notify_req_shard_removed(shard_id, cb);
                }
            }
            return;
        }
        let res = match job {
            Job::Registration(reg) => {
                self.handle_registration(reg);
                Ok(())
            }
            Job::ApplyEntries {
                shard_id,
                term,
                entries,
            } => {
                self.handle_apply_entries(shard_id, term, entries);
                Ok(())
            }
            Job::Propose {
                shard_id,
                cmd,
                is_change_peer,
            } => {
                self.handle_propose(shard_id, cmd, is_change_peer);
                Ok(())
            }
            Job::GenerateSnapshot { shard_id, task } => {
                self.handle_generate_snapshot(shard_id, task)
            }
            Job::ApplySnapshot {
                shard_id,
                status,
                snap_key,
                clear_ranges,
            } => self.handle_apply_snapshot(shard_id, status, snap_key, clear_ranges),
            Job::RaftLogGC {
                shard_id,
                start_index,
                end_index,
            } => self.handle_raft_log_gc(shard_id, start_index, end_index),
            Job::Destroy {
                shard_id,
                peer_id,
                keep_data,
            } => self.handle_destroy(shard_id, peer_id, keep_data),
        };
        if let Err(e) = res {
            error!(
                self.logger,
                "apply job failed";
                "shard_id" => shard_id,
                "err" => %e,
            );
        }
    }
}

/// The shared pool of apply workers, routed by shard id.
pub struct ApplyPipeline {
    workers: Vec<Worker<Job>>,
    destroyed: Arc<Mutex<HashSet<u64>>>,
    logger: Logger,
}

impl ApplyPipeline {
    pub fn new<E: KvEngine>(
        name: &str,
        pool_size: usize,
        store_id: u64,
        engines: &Engines<E>,
        snap_mgr: &SnapManager,
        router: &Router,
        logger: &Logger,
    ) -> Result<ApplyPipeline> {
        assert!(pool_size > 0);
        let destroyed = Arc::new(Mutex::new(HashSet::new()));
        let mut workers = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let mut worker = Worker::new(format!("{}-{}", name, i));
            worker.start(ApplyRunner::new(
                store_id,
                engines.clone(),
                snap_mgr.clone(),
                router.clone(),
                destroyed.clone(),
                logger.clone(),
            ))?;
            workers.push(worker);
        }
        Ok(ApplyPipeline {
            workers,
            destroyed,
            logger: logger.clone(),
        })
    }

    /// Enqueues a job on the shard's worker. Jobs for a destroyed shard
    /// are rejected; a rejected proposal is answered with
    /// `ShardNotFound`.
    pub fn schedule(&self, job: Job) {
        let shard_id = job.shard_id();
        if self.destroyed.lock().unwrap().contains(&shard_id) {
            self.reject(shard_id, job);
            return;
        }
        let worker = &self.workers[(shard_id % self.workers.len() as u64) as usize];
        if let Err(e) = worker.schedule(job) {
            warn!(
                self.logger,
                "failed to schedule job, shutting down?";
                "shard_id" => shard_id,
            );
            self.reject(shard_id, e.into_inner());
        }
    }

    fn reject(&self, shard_id: u64, job: Job) {
        if let Job::Propose { cmd, .. } = job {
            if let Some(cb) = cmd.into_callback() {
                notify_req_shard_removed(shard_id, cb);
            }
        }
    }

    pub fn is_destroyed(&self, shard_id: u64) -> bool {
        self.destroyed.lock().unwrap().contains(&shard_id)
    }

    /// Marks a shard as destroyed without running a destroy job; used
    /// when recovery finds a tombstoned replica.
    pub fn mark_destroyed(&self, shard_id: u64) {
        self.destroyed.lock().unwrap().insert(shard_id);
    }

    pub fn shutdown(&mut self) {
        for worker in &mut self.workers {
            worker.stop();
        }
    }
}
