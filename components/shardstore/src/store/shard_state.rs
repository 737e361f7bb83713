//! Persistent per-shard state: apply state, local state and the shard
//! descriptor, all kept in the metadata store, plus the `raft::Storage`
//! implementation reading the log from the same store.
//!
//! On load, a replica found in `Applying` state re-enters snapshot
//! application; a `Tombstone` replica must never be activated again.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError};
use std::sync::Arc;

use engine_traits::{Engines, KvEngine, Mutable, Peekable, WriteBatchExt};
use prost::Message;
use protobuf::Message as PbMessage;
use raft::eraftpb::{Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use slog::{info, warn, Logger};

use crate::config::AdjustAppliedIndexFn;
use crate::errors::Result;
use crate::keys;
use crate::metapb::Shard;
use crate::raftpb::{ApplyState, RaftLocalState, SnapshotHeader, TruncatedState};
use crate::store::util;
use crate::box_err;

// When a shard is created, its log starts beyond zero so that an empty
// on-demand replica is forced to catch up through a snapshot first.
pub const RAFT_INIT_LOG_TERM: u64 = 5;
pub const RAFT_INIT_LOG_INDEX: u64 = 5;

const MAX_SNAP_TRY_CNT: usize = 5;

pub const JOB_STATUS_PENDING: usize = 0;
pub const JOB_STATUS_RUNNING: usize = 1;
pub const JOB_STATUS_CANCELLING: usize = 2;
pub const JOB_STATUS_CANCELLED: usize = 3;
pub const JOB_STATUS_FINISHED: usize = 4;
pub const JOB_STATUS_FAILED: usize = 5;

/// Possible status returned by `check_applying_snap`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CheckApplyingSnapStatus {
    /// A snapshot was just applied.
    Success,
    /// A snapshot is being applied.
    Applying,
    /// No snapshot is being applied, or the application was cancelled.
    Idle,
}

#[derive(Debug)]
pub enum SnapState {
    Relax,
    Generating {
        canceled: Arc<AtomicBool>,
        receiver: Receiver<Snapshot>,
    },
    Applying(Arc<AtomicUsize>),
    ApplyAborted,
}

impl PartialEq for SnapState {
    fn eq(&self, other: &SnapState) -> bool {
        match (self, other) {
            (&SnapState::Relax, &SnapState::Relax)
            | (&SnapState::ApplyAborted, &SnapState::ApplyAborted)
            | (&SnapState::Generating { .. }, &SnapState::Generating { .. }) => true,
            (&SnapState::Applying(ref b1), &SnapState::Applying(ref b2)) => {
                b1.load(Ordering::Relaxed) == b2.load(Ordering::Relaxed)
            }
            _ => false,
        }
    }
}

/// Handle given to the generate-snapshot job; the produced snapshot flows
/// back through `notifier` into the pending `snapshot()` call.
pub struct GenSnapTask {
    pub shard_id: u64,
    pub canceled: Arc<AtomicBool>,
    pub notifier: SyncSender<Snapshot>,
}

impl std::fmt::Debug for GenSnapTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenSnapTask")
            .field("shard_id", &self.shard_id)
            .finish()
    }
}

fn init_hard_state<E: KvEngine>(engines: &Engines<E>, shard: &Shard) -> Result<RaftLocalState> {
    if let Some(state) = engines.meta.get_msg(&keys::hard_state_key(shard.id))? {
        return Ok(state);
    }

    let mut raft_state = RaftLocalState::default();
    if util::is_shard_initialized(shard) {
        // A freshly created (bootstrap or split) shard.
        raft_state.last_index = RAFT_INIT_LOG_INDEX;
        raft_state.term = RAFT_INIT_LOG_TERM;
        raft_state.commit = RAFT_INIT_LOG_INDEX;
        let mut wb = engines.meta.write_batch();
        wb.put_msg(&keys::hard_state_key(shard.id), &raft_state)?;
        engines.meta.write(&wb)?;
    }
    Ok(raft_state)
}

fn init_apply_state<E: KvEngine>(engines: &Engines<E>, shard: &Shard) -> Result<ApplyState> {
    Ok(
        match engines.meta.get_msg(&keys::apply_state_key(shard.id))? {
            Some(s) => s,
            None => {
                let mut apply_state = ApplyState::default();
                if util::is_shard_initialized(shard) {
                    apply_state.applied_index = RAFT_INIT_LOG_INDEX;
                    apply_state.applied_term = RAFT_INIT_LOG_TERM;
                    *apply_state.mut_truncated() = TruncatedState {
                        index: RAFT_INIT_LOG_INDEX,
                        term: RAFT_INIT_LOG_TERM,
                    };
                }
                apply_state
            }
        },
    )
}

pub(crate) fn load_log_entry<E: KvEngine>(engines: &Engines<E>, shard_id: u64, index: u64) -> Result<Entry> {
    let value = engines
        .meta
        .get_value(&keys::raft_log_key(shard_id, index))?;
    match value {
        Some(v) => {
            let entry = PbMessage::parse_from_bytes(&v)?;
            Ok(entry)
        }
        None => Err(box_err!(
            "[shard {}] entry at {} doesn't exist, may lose data",
            shard_id,
            index
        )),
    }
}

fn init_applied_term<E: KvEngine>(
    engines: &Engines<E>,
    shard: &Shard,
    apply_state: &ApplyState,
) -> Result<u64> {
    if apply_state.applied_index == RAFT_INIT_LOG_INDEX {
        return Ok(RAFT_INIT_LOG_TERM);
    }
    if apply_state.applied_index == apply_state.truncated().index {
        return Ok(apply_state.truncated().term);
    }
    Ok(load_log_entry(engines, shard.id, apply_state.applied_index)?.get_term())
}

fn init_last_term<E: KvEngine>(
    engines: &Engines<E>,
    shard: &Shard,
    raft_state: &RaftLocalState,
    apply_state: &ApplyState,
) -> Result<u64> {
    let last_idx = raft_state.last_index;
    if last_idx == 0 {
        return Ok(0);
    } else if last_idx == RAFT_INIT_LOG_INDEX {
        return Ok(RAFT_INIT_LOG_TERM);
    } else if last_idx == apply_state.truncated().index {
        return Ok(apply_state.truncated().term);
    }
    Ok(load_log_entry(engines, shard.id, last_idx)?.get_term())
}

fn validate_states(
    shard_id: u64,
    raft_state: &mut RaftLocalState,
    apply_state: &ApplyState,
    logger: &Logger,
) -> Result<()> {
    // The persisted commit index may lag the applied index when apply
    // state was written after the last hard-state flush; forward it.
    if raft_state.commit < apply_state.applied_index {
        info!(
            logger,
            "updating commit index";
            "shard_id" => shard_id,
            "old" => raft_state.commit,
            "new" => apply_state.applied_index,
        );
        raft_state.commit = apply_state.applied_index;
    }
    if raft_state.commit > raft_state.last_index {
        return Err(box_err!(
            "shard {}: commit index {} > last index {}, state corrupted",
            shard_id,
            raft_state.commit,
            raft_state.last_index
        ));
    }
    if apply_state.applied_index < apply_state.truncated().index {
        return Err(box_err!(
            "shard {}: applied index {} < truncated index {}",
            shard_id,
            apply_state.applied_index,
            apply_state.truncated().index
        ));
    }
    Ok(())
}

pub struct ShardState<E: KvEngine> {
    pub engines: Engines<E>,

    peer_id: u64,
    shard: Shard,
    raft_state: RaftLocalState,
    apply_state: ApplyState,
    applied_term: u64,
    last_term: u64,

    snap_state: RefCell<SnapState>,
    gen_snap_task: RefCell<Option<GenSnapTask>>,
    snap_tried_cnt: RefCell<usize>,

    pub tag: String,
    logger: Logger,
}

impl<E: KvEngine> Storage for ShardState<E> {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let mut hard_state = HardState::default();
        hard_state.set_term(self.raft_state.term);
        hard_state.set_vote(self.raft_state.vote);
        hard_state.set_commit(self.raft_state.commit);
        if hard_state == HardState::default() {
            assert!(
                !self.is_initialized(),
                "{} is initialized but local state has empty hard state",
                self.tag,
            );
            return Ok(RaftState::new(hard_state, Default::default()));
        }
        Ok(RaftState::new(
            hard_state,
            util::conf_state_from_shard(&self.shard),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.check_range(low, high)?;
        let max_size = max_size.into().unwrap_or(u64::MAX);
        let mut ents = Vec::with_capacity((high - low) as usize);
        if low == high {
            return Ok(ents);
        }
        let mut fetched_size = 0;
        for idx in low..high {
            let entry = load_log_entry(&self.engines, self.shard.id, idx)
                .map_err(|e| raft::Error::Store(StorageError::Other(e.into())))?;
            fetched_size += u64::from(entry.compute_size());
            if fetched_size > max_size && !ents.is_empty() {
                break;
            }
            ents.push(entry);
        }
        Ok(ents)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        if idx == self.truncated_index() {
            return Ok(self.truncated_term());
        }
        self.check_range(idx, idx + 1)?;
        if self.truncated_term() == self.last_term || idx == self.last_index() {
            return Ok(self.last_term);
        }
        let entry = load_log_entry(&self.engines, self.shard.id, idx)
            .map_err(|e| raft::Error::Store(StorageError::Other(e.into())))?;
        Ok(entry.get_term())
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.last_index())
    }

    fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        self.snapshot(request_index, to)
    }
}

impl<E: KvEngine> ShardState<E> {
    pub fn new(
        engines: Engines<E>,
        shard: &Shard,
        peer_id: u64,
        adjust_applied_index: Option<AdjustAppliedIndexFn>,
        logger: Logger,
    ) -> Result<ShardState<E>> {
        let tag = format!("[shard {}] {}", shard.id, peer_id);
        let mut raft_state = init_hard_state(&engines, shard)?;
        let mut apply_state = init_apply_state(&engines, shard)?;
        if let Some(adjust) = adjust_applied_index {
            let adjusted = adjust(shard, apply_state.applied_index);
            if adjusted != apply_state.applied_index {
                warn!(
                    logger,
                    "applied index adjusted on init";
                    "shard_id" => shard.id,
                    "peer_id" => peer_id,
                    "from" => apply_state.applied_index,
                    "to" => adjusted,
                );
                apply_state.applied_index =
                    std::cmp::max(adjusted, apply_state.truncated().index);
            }
        }
        validate_states(shard.id, &mut raft_state, &apply_state, &logger)?;
        let applied_term = init_applied_term(&engines, shard, &apply_state)?;
        let last_term = init_last_term(&engines, shard, &raft_state, &apply_state)?;

        Ok(ShardState {
            engines,
            peer_id,
            shard: shard.clone(),
            raft_state,
            apply_state,
            applied_term,
            last_term,
            snap_state: RefCell::new(SnapState::Relax),
            gen_snap_task: RefCell::new(None),
            snap_tried_cnt: RefCell::new(0),
            tag,
            logger,
        })
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        util::is_shard_initialized(&self.shard)
    }

    fn check_range(&self, low: u64, high: u64) -> raft::Result<()> {
        if low > high {
            return Err(raft::Error::Store(StorageError::Other(
                box_err!("low {} is greater than high {}", low, high),
            )));
        } else if low <= self.truncated_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        } else if high > self.last_index() + 1 {
            return Err(raft::Error::Store(StorageError::Other(box_err!(
                "entries' high {} is out of bound, last index {}",
                high,
                self.last_index()
            ))));
        }
        Ok(())
    }

    #[inline]
    pub fn first_index(&self) -> u64 {
        self.truncated_index() + 1
    }

    #[inline]
    pub fn last_index(&self) -> u64 {
        self.raft_state.last_index
    }

    #[inline]
    pub fn truncated_index(&self) -> u64 {
        self.apply_state.truncated().index
    }

    #[inline]
    pub fn truncated_term(&self) -> u64 {
        self.apply_state.truncated().term
    }

    #[inline]
    pub fn applied_index(&self) -> u64 {
        self.apply_state.applied_index
    }

    #[inline]
    pub fn applied_term(&self) -> u64 {
        self.applied_term
    }

    #[inline]
    pub fn apply_state(&self) -> &ApplyState {
        &self.apply_state
    }

    #[inline]
    pub fn set_apply_state(&mut self, apply_state: ApplyState, applied_term: u64) {
        self.apply_state = apply_state;
        self.applied_term = applied_term;
    }

    #[inline]
    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    #[inline]
    pub fn set_shard(&mut self, shard: Shard) {
        self.shard = shard;
    }

    #[inline]
    pub fn peer_id(&self) -> u64 {
        self.peer_id
    }

    #[inline]
    pub fn hard_state(&self) -> &RaftLocalState {
        &self.raft_state
    }

    pub fn set_hard_state(&mut self, hs: &HardState) {
        self.raft_state.term = hs.get_term();
        self.raft_state.vote = hs.get_vote();
        self.raft_state.commit = hs.get_commit();
    }

    pub fn set_commit_index(&mut self, commit: u64) {
        debug_assert!(commit >= self.raft_state.commit);
        self.raft_state.commit = commit;
    }

    pub fn save_hard_state_to(&self, wb: &mut E::WriteBatch) -> Result<()> {
        wb.put_msg(&keys::hard_state_key(self.shard.id), &self.raft_state)?;
        Ok(())
    }

    /// Appends entries to the log and cuts off any stale tail the
    /// previous leader may have left.
    pub fn append(&mut self, entries: Vec<Entry>, wb: &mut E::WriteBatch) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let prev_last_index = self.raft_state.last_index;
        let (last_index, last_term) = {
            let e = entries.last().unwrap();
            (e.get_index(), e.get_term())
        };
        for entry in &entries {
            let data = PbMessage::write_to_bytes(entry)?;
            wb.put(&keys::raft_log_key(self.shard.id, entry.get_index()), &data)?;
        }
        for idx in last_index + 1..=prev_last_index {
            wb.delete(&keys::raft_log_key(self.shard.id, idx))?;
        }
        self.raft_state.last_index = last_index;
        self.last_term = last_term;
        Ok(())
    }

    /// Gets a snapshot; if none is ready, kicks off asynchronous
    /// generation and reports `SnapshotTemporarilyUnavailable` so raft
    /// retries later.
    pub fn snapshot(&self, request_index: u64, to: u64) -> raft::Result<Snapshot> {
        let mut snap_state = self.snap_state.borrow_mut();
        let mut tried_cnt = self.snap_tried_cnt.borrow_mut();

        let (mut tried, mut last_canceled, mut snap) = (false, false, None);
        if let SnapState::Generating {
            ref canceled,
            ref receiver,
        } = *snap_state
        {
            tried = true;
            last_canceled = canceled.load(Ordering::SeqCst);
            match receiver.try_recv() {
                Err(TryRecvError::Empty) => {
                    return Err(raft::Error::Store(
                        StorageError::SnapshotTemporarilyUnavailable,
                    ));
                }
                Ok(s) if !last_canceled => snap = Some(s),
                Err(TryRecvError::Disconnected) | Ok(_) => {}
            }
        }

        if tried {
            *snap_state = SnapState::Relax;
            match snap {
                Some(s) => {
                    *tried_cnt = 0;
                    if self.validate_snap(&s, request_index) {
                        return Ok(s);
                    }
                }
                None => {
                    warn!(
                        self.logger,
                        "failed to try generating snapshot";
                        "shard_id" => self.shard.id,
                        "peer_id" => self.peer_id,
                        "times" => *tried_cnt,
                    );
                }
            }
        }

        if *tried_cnt >= MAX_SNAP_TRY_CNT {
            let cnt = *tried_cnt;
            *tried_cnt = 0;
            return Err(raft::Error::Store(StorageError::Other(box_err!(
                "failed to get snapshot after {} times",
                cnt
            ))));
        }

        info!(
            self.logger,
            "requesting snapshot";
            "shard_id" => self.shard.id,
            "peer_id" => self.peer_id,
            "request_index" => request_index,
            "request_peer" => to,
        );

        if !tried || !last_canceled {
            *tried_cnt += 1;
        }

        let (sender, receiver) = std::sync::mpsc::sync_channel(1);
        let canceled = Arc::new(AtomicBool::new(false));
        *snap_state = SnapState::Generating {
            canceled: canceled.clone(),
            receiver,
        };
        let task = GenSnapTask {
            shard_id: self.shard.id,
            canceled,
            notifier: sender,
        };
        let mut gen_snap_task = self.gen_snap_task.borrow_mut();
        assert!(gen_snap_task.is_none());
        *gen_snap_task = Some(task);
        Err(raft::Error::Store(
            StorageError::SnapshotTemporarilyUnavailable,
        ))
    }

    fn validate_snap(&self, snap: &Snapshot, request_index: u64) -> bool {
        let idx = snap.get_metadata().get_index();
        if idx < self.truncated_index() || idx < request_index {
            // Stale snapshot, should generate again.
            info!(
                self.logger,
                "snapshot is stale, generate again";
                "shard_id" => self.shard.id,
                "snap_index" => idx,
                "truncated_index" => self.truncated_index(),
                "request_index" => request_index,
            );
            return false;
        }
        match SnapshotHeader::decode(snap.get_data()) {
            Ok(header) => {
                let snap_epoch = header.shard().epoch();
                let latest_epoch = self.shard.epoch();
                if snap_epoch.conf_version < latest_epoch.conf_version {
                    info!(
                        self.logger,
                        "snapshot epoch is stale";
                        "shard_id" => self.shard.id,
                        "snap_epoch" => ?snap_epoch,
                        "latest_epoch" => ?latest_epoch,
                    );
                    return false;
                }
            }
            Err(e) => {
                warn!(
                    self.logger,
                    "failed to decode snapshot, it may be corrupted";
                    "shard_id" => self.shard.id,
                    "err" => %e,
                );
                return false;
            }
        }
        true
    }

    pub fn has_gen_snap_task(&self) -> bool {
        self.gen_snap_task.borrow().is_some()
    }

    pub fn take_gen_snap_task(&mut self) -> Option<GenSnapTask> {
        self.gen_snap_task.get_mut().take()
    }

    /// Applies the metadata side of an inbound snapshot: the replica goes
    /// to `Applying` and its states jump to the snapshot position, all in
    /// the caller's metadata batch. The data payload is installed by the
    /// apply-snapshot job afterwards.
    pub fn apply_snapshot(&mut self, snap: &Snapshot, wb: &mut E::WriteBatch) -> Result<Shard> {
        info!(
            self.logger,
            "begin to apply snapshot";
            "shard_id" => self.shard.id,
            "peer_id" => self.peer_id,
        );

        let header = SnapshotHeader::decode(snap.get_data())?;
        let shard = header.shard().clone();
        if shard.id != self.shard.id {
            return Err(box_err!("mismatch shard id {} != {}", self.shard.id, shard.id));
        }

        if self.is_initialized() {
            // Stale log entries are dropped wholesale; the snapshot
            // replaces them.
            wb.delete_range(
                &keys::raft_log_prefix(self.shard.id),
                &keys::raft_log_prefix_end(self.shard.id),
            )?;
        }

        crate::store::apply::write_shard_state(
            wb,
            &shard,
            crate::raftpb::PeerState::Applying,
            &self.tag,
        );

        let last_index = snap.get_metadata().get_index();
        let last_term = snap.get_metadata().get_term();
        self.raft_state.last_index = last_index;
        self.raft_state.commit = last_index;
        self.last_term = last_term;
        self.apply_state.applied_index = last_index;
        self.apply_state.applied_term = last_term;
        // The snapshot only covers log up to its index, so the truncated
        // position moves there too.
        *self.apply_state.mut_truncated() = TruncatedState {
            index: last_index,
            term: last_term,
        };
        wb.put_msg(&keys::apply_state_key(self.shard.id), &self.apply_state)?;
        self.save_hard_state_to(wb)?;

        info!(
            self.logger,
            "apply snapshot with state ok";
            "shard_id" => self.shard.id,
            "peer_id" => self.peer_id,
            "state" => ?self.apply_state,
        );

        self.shard = shard.clone();
        Ok(shard)
    }

    #[inline]
    pub fn is_applying_snapshot(&self) -> bool {
        matches!(*self.snap_state.borrow(), SnapState::Applying(_))
    }

    #[inline]
    pub fn is_generating_snapshot(&self) -> bool {
        matches!(*self.snap_state.borrow(), SnapState::Generating { .. })
    }

    /// Checks whether the in-flight snapshot application finished.
    pub fn check_applying_snap(&mut self) -> CheckApplyingSnapStatus {
        let mut res = CheckApplyingSnapStatus::Idle;
        let new_state = match *self.snap_state.borrow() {
            SnapState::Applying(ref status) => {
                let s = status.load(Ordering::Relaxed);
                if s == JOB_STATUS_FINISHED {
                    res = CheckApplyingSnapStatus::Success;
                    SnapState::Relax
                } else if s == JOB_STATUS_CANCELLED {
                    SnapState::ApplyAborted
                } else if s == JOB_STATUS_FAILED {
                    panic!("{} applying snapshot failed", self.tag);
                } else {
                    return CheckApplyingSnapStatus::Applying;
                }
            }
            _ => return res,
        };
        *self.snap_state.borrow_mut() = new_state;
        res
    }

    /// Cancels an in-flight snapshot application. Returns true only if
    /// the job is known not to run to completion; on false the caller
    /// must re-check `is_applying_snapshot` and tolerate the installed
    /// snapshot.
    pub fn cancel_applying_snap(&mut self) -> bool {
        let is_canceled = match *self.snap_state.borrow() {
            SnapState::Applying(ref status) => {
                if status
                    .compare_exchange(
                        JOB_STATUS_PENDING,
                        JOB_STATUS_CANCELLING,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    true
                } else if status
                    .compare_exchange(
                        JOB_STATUS_RUNNING,
                        JOB_STATUS_CANCELLING,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    return false;
                } else {
                    false
                }
            }
            _ => return false,
        };
        if is_canceled {
            *self.snap_state.borrow_mut() = SnapState::ApplyAborted;
            return true;
        }
        self.check_applying_snap() != CheckApplyingSnapStatus::Applying
    }

    /// Cancels an in-flight snapshot generation, e.g. when the replica is
    /// destroyed.
    pub fn cancel_generating_snap(&mut self) {
        let snap_state = self.snap_state.borrow();
        if let SnapState::Generating { ref canceled, .. } = *snap_state {
            canceled.store(true, Ordering::SeqCst);
        }
    }

    #[inline]
    pub fn set_snap_state(&mut self, state: SnapState) {
        *self.snap_state.borrow_mut() = state;
    }
}
