//! The split-check worker.
//!
//! Runs on its own pool: the scan is engine-bound work that only reads
//! the data store, so it never races with apply. The result is routed
//! back to the replica, which re-validates leadership and epoch before
//! asking the placement driver for split ids.

use std::fmt::{self, Display, Formatter};

use engine_traits::{KvEngine, RangeStatsExt};
use slog::{info, warn, Logger};

use crate::config::SplitCheckFn;
use crate::keys;
use crate::metapb::{Shard, ShardEpoch};
use crate::store::msg::PeerMsg;
use crate::store::router::Router;

pub struct SplitCheckTask {
    pub shard: Shard,
    /// Epoch observed when the check was enqueued; a concurrent
    /// split/merge invalidates the result.
    pub epoch_at_check: ShardEpoch,
    pub capacity: u64,
    /// User-supplied policy returning explicit split keys.
    pub custom: Option<SplitCheckFn>,
}

impl Display for SplitCheckTask {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "split check [shard {}], epoch {:?}, capacity {}",
            self.shard.id, self.epoch_at_check, self.capacity
        )
    }
}

pub struct SplitCheckRunner<E: KvEngine> {
    data_engine: E,
    router: Router,
    logger: Logger,
}

impl<E: KvEngine> SplitCheckRunner<E> {
    pub fn new(data_engine: E, router: Router, logger: Logger) -> SplitCheckRunner<E> {
        SplitCheckRunner {
            data_engine,
            router,
            logger,
        }
    }
}

impl<E: KvEngine> crate::util::worker::Runnable<SplitCheckTask> for SplitCheckRunner<E> {
    fn run(&mut self, task: SplitCheckTask) {
        let shard = &task.shard;
        let (size, split_keys) = if let Some(check) = &task.custom {
            match check(shard) {
                Ok(res) => res,
                Err(e) => {
                    warn!(
                        self.logger,
                        "custom split check failed";
                        "shard_id" => shard.id,
                        "err" => %e,
                    );
                    return;
                }
            }
        } else {
            let start = keys::enc_start_key(shard);
            let end = keys::enc_end_key(shard);
            match self.data_engine.split_check(&start, &end, task.capacity) {
                Ok((size, encoded)) => (
                    size,
                    encoded
                        .iter()
                        .map(|k| keys::origin_key(k).to_vec())
                        .collect(),
                ),
                Err(e) => {
                    warn!(
                        self.logger,
                        "failed to scan split keys";
                        "shard_id" => shard.id,
                        "err" => %e,
                    );
                    return;
                }
            }
        };

        // A degenerate key on the range boundary aborts the check.
        let split_keys: Vec<Vec<u8>> = {
            let degenerate = split_keys.iter().any(|k| {
                k.as_slice() <= shard.start_key.as_slice()
                    || (!shard.end_key.is_empty() && k.as_slice() >= shard.end_key.as_slice())
            });
            if degenerate { vec![] } else { split_keys }
        };

        if !split_keys.is_empty() {
            info!(
                self.logger,
                "shard needs to split";
                "shard_id" => shard.id,
                "size" => size,
                "split_keys" => split_keys.len(),
            );
        }
        let _ = self.router.send_peer(
            shard.id,
            PeerMsg::SplitCheckResult {
                epoch_at_check: task.epoch_at_check,
                size,
                split_keys,
            },
        );
    }
}
