//! One shard replica: the raft group wrapper and its interaction with
//! the job pipeline, the split checker and the placement driver.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use engine_traits::{Engines, KvEngine, WriteBatch, WriteBatchExt, WriteOptions};
use fail::fail_point;
use prost::Message;
use raft::eraftpb::{ConfChange, ConfChangeType, Entry, Message as RaftMessage};
use raft::{RawNode, StateRole, Storage};
use slog::{debug, info, warn, Logger};

use crate::cmdpb::{
    AdminCmdType, AdminRequest, ChangePeerRequest, CmdRequest, CompactLogRequest, PeerChangeType,
    RequestHeader, SplitRequest,
};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::keys;
use crate::metapb::{Peer, Shard, ShardEpoch};
use crate::pd::HeartbeatAction;
use crate::store::apply::{ApplyRes, ExecResult, PendingCmd, Registration};
use crate::store::cmd_resp;
use crate::store::fsm::StoreContext;
use crate::store::msg::{Callback, RaftCommand, ShardMessage};
use crate::store::shard_state::{
    CheckApplyingSnapStatus, GenSnapTask, ShardState, SnapState, JOB_STATUS_PENDING,
};
use crate::store::snap::SnapKey;
use crate::store::util;
use crate::store::worker::{Job, SplitCheckTask};
use crate::box_err;

/// Work the store loop must do on behalf of a replica after apply
/// results were consumed.
pub enum StoreAction {
    CreatePeer { shard: Shard, campaign: bool },
    DestroySelf,
    TombstoneSource { source: Shard, commit: u64 },
}

pub struct PeerReplica<E: KvEngine> {
    pub peer: Peer,
    pub tag: String,
    raft_group: RawNode<ShardState<E>>,

    /// Bytes written since the last split check; crossing the configured
    /// hysteresis enqueues a check.
    size_diff_hint: u64,
    approximate_size: u64,
    /// A split check is in flight; don't enqueue another.
    split_check_pending: bool,
    pending_destroy: bool,

    split_check_tick: usize,
    log_gc_tick: usize,
    pd_heartbeat_tick: usize,

    /// Peers seen in message headers, for routing replies of replicas
    /// not (yet) in the descriptor.
    peer_cache: HashMap<u64, Peer>,

    logger: Logger,
}

impl<E: KvEngine> PeerReplica<E> {
    pub fn create(
        cfg: &Config,
        engines: Engines<E>,
        shard: &Shard,
        peer: Peer,
        logger: Logger,
    ) -> Result<PeerReplica<E>> {
        let tag = format!("[shard {}] {}", shard.id, peer.id);
        let adjust = cfg
            .customize
            .adjust_init_applied_index_factory
            .as_ref()
            .map(|f| f(shard.group));
        let storage = ShardState::new(engines, shard, peer.id, adjust, logger.clone())?;
        let applied_index = storage.applied_index();

        let raft_cfg = raft::Config {
            id: peer.id,
            election_tick: cfg.raft.election_interval_ticks,
            heartbeat_tick: cfg.raft.heartbeat_interval_ticks,
            applied: applied_index,
            max_size_per_msg: cfg.raft.max_size_per_msg.0,
            max_inflight_msgs: cfg.raft.max_inflight_msgs,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        let raft_group = RawNode::new(&raft_cfg, storage, &logger)?;

        Ok(PeerReplica {
            peer,
            tag,
            raft_group,
            size_diff_hint: 0,
            approximate_size: 0,
            split_check_pending: false,
            pending_destroy: false,
            split_check_tick: 0,
            log_gc_tick: 0,
            pd_heartbeat_tick: 0,
            peer_cache: HashMap::new(),
            logger,
        })
    }

    #[inline]
    pub fn shard_id(&self) -> u64 {
        self.raft_group.store().shard().id
    }

    #[inline]
    pub fn shard(&self) -> &Shard {
        self.raft_group.store().shard()
    }

    #[inline]
    pub fn is_leader(&self) -> bool {
        self.raft_group.raft.state == StateRole::Leader
    }

    #[inline]
    pub fn leader_id(&self) -> u64 {
        self.raft_group.raft.leader_id
    }

    #[inline]
    pub fn term(&self) -> u64 {
        self.raft_group.raft.term
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.raft_group.store().is_initialized()
    }

    #[inline]
    pub fn is_pending_destroy(&self) -> bool {
        self.pending_destroy
    }

    pub fn campaign(&mut self) -> Result<()> {
        self.raft_group.campaign()?;
        Ok(())
    }

    pub fn registration(&self) -> Registration {
        let store = self.raft_group.store();
        Registration {
            peer_id: self.peer.id,
            term: self.raft_group.raft.term,
            apply_state: *store.apply_state(),
            applied_term: store.applied_term(),
            shard: store.shard().clone(),
        }
    }

    fn leader_hint(&self) -> Option<Peer> {
        let leader_id = self.leader_id();
        if leader_id == raft::INVALID_ID {
            return None;
        }
        util::find_peer_by_id(self.shard(), leader_id)
            .or_else(|| self.peer_cache.get(&leader_id))
            .cloned()
    }

    /// Steps a raft message into the group.
    pub fn step(&mut self, msg: ShardMessage) {
        self.peer_cache.insert(msg.from_peer.id, msg.from_peer.clone());
        if let Err(e) = self.raft_group.step(msg.message) {
            debug!(
                self.logger,
                "step raft message failed";
                "shard_id" => self.shard_id(),
                "peer_id" => self.peer.id,
                "err" => %e,
            );
        }
    }

    /// Broadcasts a heartbeat; used to nudge raft after asynchronous
    /// events like a generated snapshot.
    pub fn ping(&mut self) {
        self.raft_group.ping();
    }

    #[inline]
    pub fn applied_index(&self) -> u64 {
        self.raft_group.store().applied_index()
    }

    pub fn set_snap_state(&mut self, state: SnapState) {
        self.raft_group.mut_store().set_snap_state(state);
    }

    /// Seeds the split-check hint; used on freshly created replicas so a
    /// shard that is already large gets checked soon.
    pub fn set_size_diff_hint(&mut self, hint: u64) {
        self.size_diff_hint = hint;
    }

    /// Proposes a client command through the raft log and registers the
    /// pending callback with the apply delegate.
    pub fn propose(&mut self, ctx: &mut StoreContext<E>, cmd: RaftCommand) {
        let RaftCommand {
            request,
            callback,
            deadline,
            ..
        } = cmd;

        if self.pending_destroy {
            callback.invoke_with_response(cmd_resp::err_resp(
                Error::ShardNotFound(self.shard_id()),
                self.term(),
            ));
            return;
        }
        if !self.is_leader() {
            callback.invoke_with_response(cmd_resp::err_resp(
                Error::NotLeader(self.shard_id(), self.leader_hint()),
                self.term(),
            ));
            return;
        }
        if let Err(e) = util::check_shard_epoch(&request, self.shard()) {
            callback.invoke_with_response(cmd_resp::err_resp(e, self.term()));
            return;
        }

        let is_change_peer = request.has_admin_request()
            && request.admin_request().cmd_type() == AdminCmdType::ChangePeer;
        let data = request.encode_to_vec();
        let last_index = self.raft_group.raft.raft_log.last_index();

        let res = if is_change_peer {
            let change = request.admin_request().change_peer.as_ref().unwrap();
            let peer = change.peer.clone().unwrap_or_default();
            let mut cc = ConfChange::default();
            cc.set_change_type(match change.change_type() {
                PeerChangeType::AddNode => ConfChangeType::AddNode,
                PeerChangeType::RemoveNode => ConfChangeType::RemoveNode,
                PeerChangeType::AddLearnerNode => ConfChangeType::AddLearnerNode,
            });
            cc.set_node_id(peer.id);
            cc.set_context(data.into());
            self.raft_group.propose_conf_change(vec![], cc)
        } else {
            self.raft_group.propose(vec![], data)
        };

        if let Err(e) = res {
            callback.invoke_with_response(cmd_resp::err_resp(e.into(), self.term()));
            return;
        }
        let index = self.raft_group.raft.raft_log.last_index();
        if index == last_index {
            // The proposal was silently dropped, e.g. because another
            // conf change is in flight.
            callback.invoke_with_response(cmd_resp::err_resp(Error::StaleCommand, self.term()));
            return;
        }

        let mut pending = PendingCmd::new(index, self.term(), callback);
        pending.deadline = deadline;
        ctx.pipeline.schedule(Job::Propose {
            shard_id: self.shard_id(),
            cmd: pending,
            is_change_peer,
        });
    }

    fn send_raft_messages(&mut self, ctx: &mut StoreContext<E>, msgs: Vec<RaftMessage>) {
        for msg in msgs {
            let to_peer = match util::find_peer_by_id(self.shard(), msg.get_to())
                .cloned()
                .or_else(|| self.peer_cache.get(&msg.get_to()).cloned())
            {
                Some(p) => p,
                None => {
                    debug!(
                        self.logger,
                        "failed to look up recipient peer";
                        "shard_id" => self.shard_id(),
                        "to_peer" => msg.get_to(),
                    );
                    continue;
                }
            };
            let shard = self.shard();
            let m = ShardMessage {
                shard_id: shard.id,
                group: shard.group,
                from_peer: self.peer.clone(),
                to_peer,
                epoch: shard.epoch(),
                is_tombstone: false,
                message: msg,
            };
            if let Err(e) = ctx.trans.send(m) {
                debug!(
                    self.logger,
                    "failed to send raft message";
                    "shard_id" => self.shard_id(),
                    "err" => %e,
                );
            }
        }
    }

    fn schedule_apply(&mut self, ctx: &mut StoreContext<E>, entries: Vec<Entry>) {
        ctx.pipeline.schedule(Job::ApplyEntries {
            shard_id: self.shard_id(),
            term: self.raft_group.raft.term,
            entries,
        });
    }

    /// Drives one raft ready cycle: persist, ship messages, hand
    /// committed work to the pipeline.
    pub fn handle_raft_ready(&mut self, ctx: &mut StoreContext<E>) {
        if self.pending_destroy {
            return;
        }
        if self.raft_group.store().is_applying_snapshot() {
            // Stall the ready loop until the install completes; the
            // completion message re-triggers it.
            if self.raft_group.mut_store().check_applying_snap()
                == CheckApplyingSnapStatus::Applying
            {
                return;
            }
        }
        // A follower asked for a snapshot; hand the build to the
        // pipeline. The request may surface without any other ready
        // state, so check before the early return below.
        if self.raft_group.store().has_gen_snap_task() {
            let task: GenSnapTask = self.raft_group.mut_store().take_gen_snap_task().unwrap();
            ctx.pipeline.schedule(Job::GenerateSnapshot {
                shard_id: self.shard_id(),
                task,
            });
        }
        if !self.raft_group.has_ready() {
            return;
        }

        let mut ready = self.raft_group.ready();
        let became_leader = ready.ss().map(|ss| ss.raft_state == StateRole::Leader);

        if !ready.messages().is_empty() {
            let msgs = ready.take_messages();
            self.send_raft_messages(ctx, msgs);
        }

        let mut wb = self.raft_group.store().engines.meta.write_batch();
        let mut installed_snapshot = None;
        if !ready.snapshot().is_empty() {
            fail_point!("raft_before_apply_snap");
            let prev_shard = self.raft_group.store().shard().clone();
            let snapshot = ready.snapshot().clone();
            let snap_index = snapshot.get_metadata().get_index();
            let snap_term = snapshot.get_metadata().get_term();
            let shard = self
                .raft_group
                .mut_store()
                .apply_snapshot(&snapshot, &mut wb)
                .unwrap_or_else(|e| panic!("{} failed to apply snapshot: {:?}", self.tag, e));
            let mut clear_ranges =
                vec![(keys::enc_start_key(&shard), keys::enc_end_key(&shard))];
            if util::is_shard_initialized(&prev_shard) {
                let old = (
                    keys::enc_start_key(&prev_shard),
                    keys::enc_end_key(&prev_shard),
                );
                if old != clear_ranges[0] {
                    clear_ranges.push(old);
                }
            }
            installed_snapshot = Some((shard, clear_ranges, snap_index, snap_term));
        }

        if !ready.entries().is_empty() {
            let entries = ready.take_entries();
            self.raft_group
                .mut_store()
                .append(entries, &mut wb)
                .unwrap_or_else(|e| panic!("{} failed to append entries: {:?}", self.tag, e));
        }
        if let Some(hs) = ready.hs() {
            let hs = hs.clone();
            self.raft_group.mut_store().set_hard_state(&hs);
        }
        self.raft_group
            .store()
            .save_hard_state_to(&mut wb)
            .unwrap_or_else(|e| panic!("{} failed to save hard state: {:?}", self.tag, e));

        if !wb.is_empty() {
            let opts = WriteOptions {
                sync: installed_snapshot.is_some(),
            };
            self.raft_group
                .store()
                .engines
                .meta
                .write_opt(&wb, &opts)
                .unwrap_or_else(|e| panic!("{} failed to persist ready: {:?}", self.tag, e));
        }

        if !ready.persisted_messages().is_empty() {
            let msgs = ready.take_persisted_messages();
            self.send_raft_messages(ctx, msgs);
        }

        let committed = ready.take_committed_entries();

        let mut snap_index_applied = None;
        if let Some((shard, clear_ranges, snap_index, snap_term)) = installed_snapshot {
            ctx.update_shard(&shard);
            let status = Arc::new(AtomicUsize::new(JOB_STATUS_PENDING));
            self.raft_group
                .mut_store()
                .set_snap_state(SnapState::Applying(status.clone()));
            ctx.pipeline.schedule(Job::ApplySnapshot {
                shard_id: shard.id,
                status,
                snap_key: Some(SnapKey::new(shard.id, snap_term, snap_index)),
                clear_ranges,
            });
            ctx.pipeline.schedule(Job::Registration(self.registration()));
            snap_index_applied = Some(snap_index);
        }

        if !committed.is_empty() {
            self.schedule_apply(ctx, committed);
        }

        let mut light_rd = self.raft_group.advance_append(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.raft_group.mut_store().set_commit_index(commit);
        }
        let msgs = light_rd.take_messages();
        if !msgs.is_empty() {
            self.send_raft_messages(ctx, msgs);
        }
        let committed = light_rd.take_committed_entries();
        if !committed.is_empty() {
            self.schedule_apply(ctx, committed);
        }
        if let Some(idx) = snap_index_applied {
            self.raft_group.advance_apply_to(idx);
        }

        if self.raft_group.store().has_gen_snap_task() {
            let task: GenSnapTask = self.raft_group.mut_store().take_gen_snap_task().unwrap();
            ctx.pipeline.schedule(Job::GenerateSnapshot {
                shard_id: self.shard_id(),
                task,
            });
        }

        if let Some(is_leader) = became_leader {
            ctx.on_role_changed(self.shard_id(), self.peer.id, is_leader);
            if is_leader {
                self.heartbeat_pd(ctx);
            }
        }
    }

    /// Consumes an apply result: advances the raft applied cursor and
    /// reacts to admin side effects.
    pub fn post_apply(&mut self, ctx: &mut StoreContext<E>, res: ApplyRes) -> Vec<StoreAction> {
        let mut actions = Vec::new();
        let applied_index = res.apply_state.applied_index;
        if applied_index < self.raft_group.store().applied_index() {
            // A result from entries applied just before a snapshot
            // install; the snapshot superseded everything in it.
            return actions;
        }
        self.raft_group
            .mut_store()
            .set_apply_state(res.apply_state, res.applied_term);
        self.raft_group.advance_apply_to(applied_index);

        if res.metrics.size_diff_hint >= 0 {
            self.size_diff_hint += res.metrics.size_diff_hint as u64;
        } else {
            self.size_diff_hint = self
                .size_diff_hint
                .saturating_sub((-res.metrics.size_diff_hint) as u64);
        }

        for exec_result in res.exec_results {
            match exec_result {
                ExecResult::ChangePeer {
                    shard,
                    changes,
                    conf_change,
                } => {
                    if !changes.is_empty() {
                        self.raft_group
                            .apply_conf_change(&conf_change)
                            .unwrap_or_else(|e| {
                                panic!("{} failed to apply conf change: {:?}", self.tag, e)
                            });
                        let removed_self = changes.iter().any(|c| {
                            c.change_type() == PeerChangeType::RemoveNode
                                && c.peer.as_ref().map_or(false, |p| p.id == self.peer.id)
                        });
                        self.raft_group.mut_store().set_shard(shard.clone());
                        ctx.update_shard(&shard);
                        if removed_self {
                            actions.push(StoreAction::DestroySelf);
                        }
                    }
                }
                ExecResult::Split { derived, new_shard } => {
                    self.raft_group.mut_store().set_shard(derived.clone());
                    ctx.update_shard(&derived);
                    // Seed the children's hints so both get re-checked
                    // soon; a shard half may still be over capacity.
                    self.size_diff_hint = ctx.cfg.replication.shard_split_check_bytes.0;
                    self.split_check_pending = false;
                    if self.is_leader() {
                        if let Err(e) = ctx.pd.report_split(derived.clone(), new_shard.clone()) {
                            warn!(
                                self.logger,
                                "report split to placement driver failed";
                                "shard_id" => self.shard_id(),
                                "err" => %e,
                            );
                        }
                    }
                    actions.push(StoreAction::CreatePeer {
                        shard: new_shard,
                        campaign: self.is_leader(),
                    });
                }
                ExecResult::Merge {
                    shard,
                    source,
                    commit,
                } => {
                    self.raft_group.mut_store().set_shard(shard.clone());
                    ctx.update_shard(&shard);
                    actions.push(StoreAction::TombstoneSource { source, commit });
                }
                ExecResult::CompactLog { state, first_index } => {
                    ctx.pipeline.schedule(Job::RaftLogGC {
                        shard_id: self.shard_id(),
                        start_index: first_index,
                        end_index: state.index + 1,
                    });
                }
            }
        }
        actions
    }

    pub fn on_tick(&mut self, ctx: &mut StoreContext<E>) {
        if self.pending_destroy {
            return;
        }
        self.raft_group.tick();

        self.split_check_tick += 1;
        if self.split_check_tick >= ctx.cfg.raft.split_check_interval_ticks {
            self.split_check_tick = 0;
            self.on_split_check_tick(ctx);
        }
        self.log_gc_tick += 1;
        if self.log_gc_tick >= ctx.cfg.raft.log_gc_interval_ticks {
            self.log_gc_tick = 0;
            self.on_log_gc_tick(ctx);
        }
        self.pd_heartbeat_tick += 1;
        if self.pd_heartbeat_tick >= ctx.cfg.raft.pd_heartbeat_interval_ticks {
            self.pd_heartbeat_tick = 0;
            self.heartbeat_pd(ctx);
        }
    }

    fn on_split_check_tick(&mut self, ctx: &mut StoreContext<E>) {
        if !self.is_leader() || self.split_check_pending {
            return;
        }
        if self.size_diff_hint < ctx.cfg.replication.shard_split_check_bytes.0 {
            return;
        }
        let shard = self.shard().clone();
        info!(
            self.logger,
            "size hint over threshold, schedule split check";
            "shard_id" => shard.id,
            "size_diff_hint" => self.size_diff_hint,
        );
        self.size_diff_hint = 0;
        self.split_check_pending = true;
        let custom = ctx
            .cfg
            .customize
            .split_check_factory
            .as_ref()
            .map(|f| f(shard.group));
        let task = SplitCheckTask {
            epoch_at_check: shard.epoch(),
            shard,
            capacity: ctx.cfg.replication.shard_capacity_bytes.0,
            custom,
        };
        if ctx.split_scheduler.schedule(task).is_err() {
            self.split_check_pending = false;
        }
    }

    /// The check protocol's second half: the split worker reported back;
    /// re-validate and propose the admin split.
    pub fn on_split_check_result(
        &mut self,
        ctx: &mut StoreContext<E>,
        epoch_at_check: ShardEpoch,
        size: u64,
        split_keys: Vec<Vec<u8>>,
    ) {
        self.split_check_pending = false;
        self.approximate_size = size;
        if split_keys.is_empty() {
            // Not big enough to split yet; recalibrate the hint to the
            // measured size so the next trigger works from real data.
            self.size_diff_hint = size;
            return;
        }
        if !self.is_leader() {
            return;
        }
        let current = self.shard().epoch();
        if current.version != epoch_at_check.version
            || (ctx.cfg.replication.split_epoch_check_conf_version
                && current.conf_version != epoch_at_check.conf_version)
        {
            info!(
                self.logger,
                "epoch changed, need re-check later";
                "shard_id" => self.shard_id(),
                "current" => ?current,
                "at_check" => ?epoch_at_check,
            );
            return;
        }

        let (new_shard_id, new_peer_ids) = match ctx.pd.ask_split(self.shard()) {
            Ok(res) => res,
            Err(e) => {
                warn!(
                    self.logger,
                    "ask split failed";
                    "shard_id" => self.shard_id(),
                    "err" => %e,
                );
                return;
            }
        };
        let split_key = split_keys.into_iter().next().unwrap();
        info!(
            self.logger,
            "try to split";
            "shard_id" => self.shard_id(),
            "size" => size,
            "split_key" => hex::encode_upper(&split_key),
            "new_shard_id" => new_shard_id,
        );
        let req = self.new_admin_request(AdminRequest {
            cmd_type: AdminCmdType::Split as i32,
            split: Some(SplitRequest {
                split_key,
                new_shard_id,
                new_peer_ids,
            }),
            ..Default::default()
        });
        self.propose(ctx, RaftCommand::new(req, Callback::None));
    }

    fn on_log_gc_tick(&mut self, ctx: &mut StoreContext<E>) {
        if !self.is_leader() {
            return;
        }
        let store = self.raft_group.store();
        let applied = store.applied_index();
        let truncated = store.truncated_index();
        if applied <= truncated
            || applied - truncated < ctx.cfg.raft.log_gc_threshold
        {
            return;
        }
        // Never compact beyond the slowest replica; it would force a
        // snapshot on it.
        let mut compact_index = applied;
        for (_, progress) in self.raft_group.raft.prs().iter() {
            if progress.matched != 0 && progress.matched < compact_index {
                compact_index = progress.matched;
            }
        }
        if compact_index <= truncated {
            return;
        }
        let compact_term = match Storage::term(self.raft_group.store(), compact_index) {
            Ok(t) => t,
            Err(e) => {
                warn!(
                    self.logger,
                    "failed to load term for log gc";
                    "shard_id" => self.shard_id(),
                    "index" => compact_index,
                    "err" => %e,
                );
                return;
            }
        };
        let req = self.new_admin_request(AdminRequest {
            cmd_type: AdminCmdType::CompactLog as i32,
            compact_log: Some(CompactLogRequest {
                compact_index,
                compact_term,
            }),
            ..Default::default()
        });
        self.propose(ctx, RaftCommand::new(req, Callback::None));
    }

    pub fn heartbeat_pd(&mut self, ctx: &mut StoreContext<E>) {
        if !self.is_leader() {
            return;
        }
        let action = match ctx.pd.shard_heartbeat(
            self.shard().clone(),
            self.peer.clone(),
            self.approximate_size,
        ) {
            Ok(a) => a,
            Err(e) => {
                warn!(
                    self.logger,
                    "shard heartbeat failed";
                    "shard_id" => self.shard_id(),
                    "err" => %e,
                );
                return;
            }
        };
        let change = match action {
            Some(HeartbeatAction::AddPeer(peer)) => ChangePeerRequest {
                change_type: PeerChangeType::AddNode as i32,
                peer: Some(peer),
            },
            Some(HeartbeatAction::RemovePeer(peer)) => ChangePeerRequest {
                change_type: PeerChangeType::RemoveNode as i32,
                peer: Some(peer),
            },
            None => return,
        };
        let req = self.new_admin_request(AdminRequest {
            cmd_type: AdminCmdType::ChangePeer as i32,
            change_peer: Some(change),
            ..Default::default()
        });
        self.propose(ctx, RaftCommand::new(req, Callback::None));
    }

    fn new_admin_request(&self, admin: AdminRequest) -> CmdRequest {
        CmdRequest {
            header: Some(RequestHeader {
                shard_id: self.shard_id(),
                peer: Some(self.peer.clone()),
                epoch: Some(self.shard().epoch()),
            }),
            requests: vec![],
            admin_request: Some(admin),
        }
    }

    /// Begins destruction: cancels snapshot work and hands the terminal
    /// destroy job to the pipeline. Returns false when an install is in
    /// flight and could not be cancelled; the caller must retry once it
    /// settles.
    pub fn prepare_destroy(&mut self, ctx: &mut StoreContext<E>, keep_data: bool) -> bool {
        if self.pending_destroy {
            return true;
        }
        self.raft_group.mut_store().cancel_generating_snap();
        if !self.raft_group.mut_store().cancel_applying_snap() {
            info!(
                self.logger,
                "stale peer is applying snapshot, will destroy next time";
                "shard_id" => self.shard_id(),
                "peer_id" => self.peer.id,
            );
            return false;
        }
        self.pending_destroy = true;
        ctx.pipeline.schedule(Job::Destroy {
            shard_id: self.shard_id(),
            peer_id: self.peer.id,
            keep_data,
        });
        true
    }

    /// Validates that an admin merge may target this shard, and builds
    /// the proposal. Exposed for admin tooling; the production trigger is
    /// the placement driver.
    pub fn new_merge_request(&self, source: &Shard, commit: u64) -> Result<CmdRequest> {
        if source.id == self.shard_id() {
            return Err(box_err!("cannot merge shard {} into itself", source.id));
        }
        Ok(self.new_admin_request(AdminRequest {
            cmd_type: AdminCmdType::Merge as i32,
            merge: Some(crate::cmdpb::MergeRequest {
                source: Some(source.clone()),
                commit,
            }),
            ..Default::default()
        }))
    }

    pub fn on_snapshot_applied(&mut self, ctx: &mut StoreContext<E>, success: bool) {
        let status = self.raft_group.mut_store().check_applying_snap();
        debug!(
            self.logger,
            "snapshot apply finished";
            "shard_id" => self.shard_id(),
            "success" => success,
            "status" => ?status,
        );
        // Resume the ready loop that was stalled on the install.
        self.handle_raft_ready(ctx);
    }
}
