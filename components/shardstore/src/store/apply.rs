//! The per-shard state-machine executor.
//!
//! Committed raft entries are decoded and executed here, strictly in log
//! order. Data mutations go into the data-engine write batch, metadata
//! mutations (shard descriptors, apply state) into the metadata batch; the
//! data batch always commits first so a crash can only leave the state
//! machine behind the log, never ahead of it — committed entries are then
//! re-applied on restart.
//!
//! Errors fall in two classes: errors that occur deterministically on
//! every replica (stale epoch, key out of range) produce an error reply
//! and still advance the apply state; engine errors and entry decode
//! errors are fatal to the replica, as dropping a mutation while advancing
//! the apply state would silently fork the state machine.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::time::Instant;

use engine_traits::{Engines, KvEngine, Mutable, Peekable, WriteBatch, WriteBatchExt, WriteOptions};
use fail::fail_point;
use prost::Message;
use protobuf::Message as PbMessage;
use raft::eraftpb::{ConfChange, Entry, EntryType};
use slog::{debug, info, warn, Logger};

use crate::cmdpb::{
    AdminCmdType, AdminRequest, AdminResponse, ChangePeerRequest, CmdRequest, CmdResponse, CmdType,
    GetResponse, PeerChangeType, Request, Response,
};
use crate::errors::{Error, Result};
use crate::keys;
use crate::metapb::{PeerRole, Shard};
use crate::raftpb::{ApplyState, PeerState, ShardLocalState, TruncatedState};
use crate::store::cmd_resp;
use crate::store::msg::Callback;
use crate::store::shard_state::{RAFT_INIT_LOG_INDEX, RAFT_INIT_LOG_TERM};
use crate::store::util;
use crate::box_err;

const SHRINK_PENDING_CMD_QUEUE_CAP: usize = 64;

pub struct PendingCmd {
    pub index: u64,
    pub term: u64,
    pub cb: Option<Callback>,
    pub deadline: Option<Instant>,
}

impl PendingCmd {
    pub fn new(index: u64, term: u64, cb: Callback) -> PendingCmd {
        PendingCmd {
            index,
            term,
            cb: Some(cb),
            deadline: None,
        }
    }

    pub fn into_callback(mut self) -> Option<Callback> {
        self.cb.take()
    }
}

impl Debug for PendingCmd {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PendingCmd [index: {}, term: {}, has_cb: {}]",
            self.index,
            self.term,
            self.cb.is_some()
        )
    }
}

/// Commands waiting to be committed and applied. At most one change-peer
/// command is pending at a time.
#[derive(Debug, Default)]
pub struct PendingCmdQueue {
    normals: VecDeque<PendingCmd>,
    change_peer: Option<PendingCmd>,
}

impl PendingCmdQueue {
    fn pop_normal(&mut self, index: u64, term: u64) -> Option<PendingCmd> {
        self.normals.pop_front().and_then(|cmd| {
            if self.normals.capacity() > SHRINK_PENDING_CMD_QUEUE_CAP
                && self.normals.len() < SHRINK_PENDING_CMD_QUEUE_CAP
            {
                self.normals.shrink_to_fit();
            }
            if (cmd.term, cmd.index) > (term, index) {
                self.normals.push_front(cmd);
                return None;
            }
            Some(cmd)
        })
    }

    fn append_normal(&mut self, cmd: PendingCmd) {
        self.normals.push_back(cmd);
    }

    fn take_change_peer(&mut self) -> Option<PendingCmd> {
        self.change_peer.take()
    }

    fn set_change_peer(&mut self, cmd: PendingCmd) {
        self.change_peer = Some(cmd);
    }

    fn drain_expired(&mut self, now: Instant) -> Vec<PendingCmd> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.normals.len());
        for cmd in self.normals.drain(..) {
            if cmd.deadline.map_or(false, |d| d <= now) {
                expired.push(cmd);
            } else {
                kept.push_back(cmd);
            }
        }
        self.normals = kept;
        if self
            .change_peer
            .as_ref()
            .and_then(|c| c.deadline)
            .map_or(false, |d| d <= now)
        {
            expired.push(self.change_peer.take().unwrap());
        }
        expired
    }
}

/// Side effects of applying admin entries, reported back to the raft side.
#[derive(Debug)]
pub enum ExecResult {
    ChangePeer {
        shard: Shard,
        /// Empty when the conf change was refused; raft still gets an
        /// empty conf change applied so it can unblock.
        changes: Vec<ChangePeerRequest>,
        conf_change: ConfChange,
    },
    Split {
        derived: Shard,
        new_shard: Shard,
    },
    Merge {
        shard: Shard,
        source: Shard,
        commit: u64,
    },
    CompactLog {
        state: TruncatedState,
        first_index: u64,
    },
}

#[derive(Clone, Copy, Debug, Default)]
pub struct ApplyMetrics {
    pub written_bytes: u64,
    pub written_keys: u64,
    pub size_diff_hint: i64,
    pub delete_keys_hint: u64,
}

/// Result of one apply round for one shard, consumed by the raft side to
/// advance its applied cursor.
pub struct ApplyRes {
    pub shard_id: u64,
    pub apply_state: ApplyState,
    pub applied_term: u64,
    pub exec_results: Vec<ExecResult>,
    pub metrics: ApplyMetrics,
}

/// State captured when (re-)registering a delegate.
pub struct Registration {
    pub peer_id: u64,
    pub term: u64,
    pub apply_state: ApplyState,
    pub applied_term: u64,
    pub shard: Shard,
}

pub struct ApplyContext<'a, E: KvEngine> {
    pub store_id: u64,
    pub engines: &'a Engines<E>,
    pub logger: &'a Logger,
    data_wb: E::WriteBatch,
    meta_wb: E::WriteBatch,
    cbs: Vec<(Option<Callback>, CmdResponse)>,
    sync_log_hint: bool,
}

impl<'a, E: KvEngine> ApplyContext<'a, E> {
    pub fn new(store_id: u64, engines: &'a Engines<E>, logger: &'a Logger) -> ApplyContext<'a, E> {
        ApplyContext {
            store_id,
            engines,
            logger,
            data_wb: engines.data.write_batch(),
            meta_wb: engines.meta.write_batch(),
            cbs: Vec::new(),
            sync_log_hint: false,
        }
    }

    fn push_cb(&mut self, cb: Option<Callback>, resp: CmdResponse) {
        self.cbs.push((cb, resp));
    }

    /// Flushes buffered data mutations early, so a following read in the
    /// same batch observes them.
    fn commit_data(&mut self, delegate: &ApplyDelegate) {
        if !self.data_wb.is_empty() {
            self.engines
                .data
                .write(&self.data_wb)
                .unwrap_or_else(|e| panic!("{} failed to write data: {:?}", delegate.tag, e));
            self.data_wb.clear();
        }
    }

    /// Commits the round: data first, then metadata carrying the advanced
    /// apply state, then client replies.
    pub fn finish_for(&mut self, delegate: &mut ApplyDelegate) -> ApplyRes {
        delegate.write_apply_state(&mut self.meta_wb);
        self.commit_data(delegate);
        if !self.meta_wb.is_empty() {
            let opts = WriteOptions {
                sync: self.sync_log_hint,
            };
            self.engines
                .meta
                .write_opt(&self.meta_wb, &opts)
                .unwrap_or_else(|e| panic!("{} failed to write metadata: {:?}", delegate.tag, e));
            self.meta_wb.clear();
        }
        self.sync_log_hint = false;
        for (cb, resp) in self.cbs.drain(..) {
            if let Some(cb) = cb {
                cb.invoke_with_response(resp);
            }
        }
        ApplyRes {
            shard_id: delegate.shard_id(),
            apply_state: delegate.apply_state,
            applied_term: delegate.applied_term,
            exec_results: std::mem::take(&mut delegate.exec_results),
            metrics: std::mem::take(&mut delegate.metrics),
        }
    }
}

fn notify_shard_removed(shard_id: u64, peer_id: u64, logger: &Logger, mut cmd: PendingCmd) {
    debug!(
        logger,
        "shard is removed, notify commands";
        "shard_id" => shard_id,
        "peer_id" => peer_id,
        "index" => cmd.index,
        "term" => cmd.term,
    );
    notify_req_shard_removed(shard_id, cmd.cb.take().unwrap());
}

pub fn notify_req_shard_removed(shard_id: u64, cb: Callback) {
    let resp = cmd_resp::new_error(Error::ShardNotFound(shard_id));
    cb.invoke_with_response(resp);
}

/// Calls the callback of `cmd` when it can not be processed further.
fn notify_stale_command(shard_id: u64, peer_id: u64, term: u64, logger: &Logger, mut cmd: PendingCmd) {
    info!(
        logger,
        "command is stale, skip";
        "shard_id" => shard_id,
        "peer_id" => peer_id,
        "index" => cmd.index,
        "term" => cmd.term,
    );
    notify_stale_req(term, cmd.cb.take().unwrap());
}

pub fn notify_stale_req(term: u64, cb: Callback) {
    let resp = cmd_resp::err_resp(Error::StaleCommand, term);
    cb.invoke_with_response(resp);
}

fn notify_timeout_req(term: u64, cb: Callback) {
    let resp = cmd_resp::err_resp(Error::Timeout("deadline exceeded".to_owned()), term);
    cb.invoke_with_response(resp);
}

/// Checks if buffered data must be flushed before handling the command,
/// because the command reads the engine or mutates a whole range.
fn should_write_to_engine(cmd: &CmdRequest) -> bool {
    cmd.requests.iter().any(|r| {
        matches!(
            r.cmd_type(),
            CmdType::Get | CmdType::DeleteRange
        )
    })
}

/// The apply delegate of one shard replica.
pub struct ApplyDelegate {
    peer_id: u64,
    term: u64,
    shard: Shard,
    tag: String,
    /// Set when removing itself because of a `RemoveNode` conf change;
    /// following entries in the same round are skipped.
    pending_remove: bool,
    stopped: bool,
    pending_cmds: PendingCmdQueue,
    apply_state: ApplyState,
    applied_term: u64,
    exec_results: Vec<ExecResult>,
    metrics: ApplyMetrics,
}

impl ApplyDelegate {
    pub fn from_registration(reg: Registration) -> ApplyDelegate {
        ApplyDelegate {
            tag: format!("[shard {}] {}", reg.shard.id, reg.peer_id),
            peer_id: reg.peer_id,
            term: reg.term,
            shard: reg.shard,
            pending_remove: false,
            stopped: false,
            pending_cmds: PendingCmdQueue::default(),
            apply_state: reg.apply_state,
            applied_term: reg.applied_term,
            exec_results: Vec::new(),
            metrics: ApplyMetrics::default(),
        }
    }

    pub fn shard_id(&self) -> u64 {
        self.shard.id
    }

    pub fn id(&self) -> u64 {
        self.peer_id
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    pub fn apply_state(&self) -> &ApplyState {
        &self.apply_state
    }

    pub fn is_pending_remove(&self) -> bool {
        self.pending_remove
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn write_apply_state<W: WriteBatch>(&self, wb: &mut W) {
        wb.put_msg(&keys::apply_state_key(self.shard.id), &self.apply_state)
            .unwrap_or_else(|e| {
                panic!(
                    "{} failed to save apply state to write batch, error: {:?}",
                    self.tag, e
                );
            });
    }

    /// Registers a client proposal awaiting apply.
    pub fn append_pending(&mut self, cmd: PendingCmd) {
        self.pending_cmds.append_normal(cmd);
    }

    /// Replaces any prior pending change-peer command; the old one is
    /// replied to as stale.
    pub fn set_pending_change_peer(&mut self, cmd: PendingCmd, logger: &Logger) {
        if let Some(stale) = self.pending_cmds.take_change_peer() {
            if stale.cb.is_some() {
                notify_stale_command(self.shard_id(), self.peer_id, self.term, logger, stale);
            }
        }
        self.pending_cmds.set_change_peer(cmd);
    }

    /// Replies `Timeout` to every pending command whose deadline elapsed.
    /// The entries, once committed, still apply; their clients just no
    /// longer receive the result.
    pub fn sweep_timeouts(&mut self, now: Instant) {
        for mut cmd in self.pending_cmds.drain_expired(now) {
            if let Some(cb) = cmd.cb.take() {
                notify_timeout_req(self.term, cb);
            }
        }
    }

    /// Replies `ShardNotFound` to every pending command and drops them.
    pub fn notify_destroyed(&mut self, logger: &Logger) {
        self.stopped = true;
        for cmd in self.pending_cmds.normals.drain(..) {
            if cmd.cb.is_some() {
                notify_shard_removed(self.shard.id, self.peer_id, logger, cmd);
            }
        }
        if let Some(cmd) = self.pending_cmds.take_change_peer() {
            if cmd.cb.is_some() {
                notify_shard_removed(self.shard.id, self.peer_id, logger, cmd);
            }
        }
    }

    pub fn clear_all_commands_as_stale(&mut self, logger: &Logger) {
        for cmd in self.pending_cmds.normals.drain(..).collect::<Vec<_>>() {
            notify_stale_command(self.shard.id, self.peer_id, self.term, logger, cmd);
        }
        if let Some(cmd) = self.pending_cmds.take_change_peer() {
            notify_stale_command(self.shard.id, self.peer_id, self.term, logger, cmd);
        }
    }

    /// Applies a batch of committed entries in log order.
    pub fn handle_raft_committed_entries<E: KvEngine>(
        &mut self,
        ctx: &mut ApplyContext<'_, E>,
        term: u64,
        committed_entries: Vec<Entry>,
    ) {
        if committed_entries.is_empty() {
            return;
        }
        if term > self.term {
            self.term = term;
        }
        self.sweep_timeouts(Instant::now());
        for entry in committed_entries {
            if self.pending_remove {
                // This replica is about to be destroyed, skip everything.
                break;
            }
            let expect_index = self.apply_state.applied_index + 1;
            if expect_index != entry.get_index() {
                panic!(
                    "{} expect index {}, but got {}",
                    self.tag,
                    expect_index,
                    entry.get_index()
                );
            }
            match entry.get_entry_type() {
                EntryType::EntryNormal => self.handle_raft_entry_normal(ctx, &entry),
                EntryType::EntryConfChange | EntryType::EntryConfChangeV2 => {
                    self.handle_raft_entry_conf_change(ctx, &entry)
                }
            }
        }
    }

    fn handle_raft_entry_normal<E: KvEngine>(
        &mut self,
        ctx: &mut ApplyContext<'_, E>,
        entry: &Entry,
    ) {
        let index = entry.get_index();
        let term = entry.get_term();
        let data = entry.get_data();

        if !data.is_empty() {
            let cmd = CmdRequest::decode(data).unwrap_or_else(|e| {
                panic!("{} failed to decode entry at {}: {:?}", self.tag, index, e)
            });
            if should_write_to_engine(&cmd) {
                ctx.commit_data(self);
            }
            self.process_raft_cmd(ctx, index, term, cmd);
            return;
        }

        // An empty entry is proposed when a peer becomes leader. Commands
        // proposed under older terms can never be applied now.
        self.apply_state.applied_index = index;
        self.applied_term = term;
        assert!(term > 0);
        while let Some(mut cmd) = self.pending_cmds.pop_normal(u64::MAX, term - 1) {
            if let Some(cb) = cmd.cb.take() {
                ctx.push_cb(
                    Some(cb),
                    cmd_resp::err_resp(Error::StaleCommand, term),
                );
            }
        }
    }

    fn handle_raft_entry_conf_change<E: KvEngine>(
        &mut self,
        ctx: &mut ApplyContext<'_, E>,
        entry: &Entry,
    ) {
        let (index, term) = (entry.get_index(), entry.get_term());
        let conf_change: ConfChange = PbMessage::parse_from_bytes(entry.get_data())
            .unwrap_or_else(|e| {
                panic!(
                    "{} failed to decode conf change at {}: {:?}",
                    self.tag, index, e
                )
            });
        let cmd = CmdRequest::decode(conf_change.get_context()).unwrap_or_else(|e| {
            panic!(
                "{} failed to decode conf change context at {}: {:?}",
                self.tag, index, e
            )
        });
        let accepted = self.process_raft_cmd(ctx, index, term, cmd);
        match self.exec_results.last_mut() {
            Some(ExecResult::ChangePeer {
                conf_change: ref mut cc,
                ..
            }) if accepted => {
                *cc = conf_change;
            }
            _ => {
                // The change was refused (e.g. stale epoch). Raft still
                // needs an empty conf change applied to unblock.
                self.exec_results.push(ExecResult::ChangePeer {
                    shard: self.shard.clone(),
                    changes: vec![],
                    conf_change: ConfChange::default(),
                });
            }
        }
    }

    fn find_pending(&mut self, index: u64, term: u64, is_change_peer: bool, logger: &Logger) -> Option<Callback> {
        let (shard_id, peer_id) = (self.shard_id(), self.id());
        if is_change_peer {
            if let Some(mut cmd) = self.pending_cmds.take_change_peer() {
                if cmd.index == index && cmd.term == term {
                    return cmd.cb.take();
                }
                notify_stale_command(shard_id, peer_id, self.term, logger, cmd);
            }
            return None;
        }
        while let Some(mut head) = self.pending_cmds.pop_normal(index, term) {
            if head.term == term {
                if head.index == index {
                    return head.cb.take();
                }
                panic!(
                    "{} unexpected callback at term {}, found index {}, expected {}",
                    self.tag, term, head.index, index
                );
            }
            // Stale heads were superseded by a term change.
            notify_stale_command(shard_id, peer_id, self.term, logger, head);
        }
        None
    }

    /// Returns whether the command executed successfully.
    fn process_raft_cmd<E: KvEngine>(
        &mut self,
        ctx: &mut ApplyContext<'_, E>,
        index: u64,
        term: u64,
        cmd: CmdRequest,
    ) -> bool {
        if index == 0 {
            panic!("{} processing raft command needs a none zero index", self.tag);
        }

        if cmd.has_admin_request() {
            ctx.sync_log_hint = true;
        }
        let is_change_peer = cmd.has_admin_request()
            && cmd.admin_request().cmd_type() == AdminCmdType::ChangePeer;

        let (mut resp, ok) = self.apply_raft_cmd(ctx, index, term, &cmd);

        debug!(
            ctx.logger,
            "applied command";
            "shard_id" => self.shard_id(),
            "peer_id" => self.id(),
            "index" => index,
        );

        cmd_resp::bind_term(&mut resp, self.term);
        let cb = self.find_pending(index, term, is_change_peer, ctx.logger);
        ctx.push_cb(cb, resp);
        ok
    }

    /// Applies a raft command. Deterministic refusals (stale epoch, key
    /// out of range) turn into error replies and still advance the apply
    /// state; engine failures panic.
    fn apply_raft_cmd<E: KvEngine>(
        &mut self,
        ctx: &mut ApplyContext<'_, E>,
        index: u64,
        term: u64,
        req: &CmdRequest,
    ) -> (CmdResponse, bool) {
        assert!(!self.pending_remove);

        ctx.data_wb.set_save_point();
        ctx.meta_wb.set_save_point();
        let (resp, ok) = match self.exec_raft_cmd(ctx, req) {
            Ok(resp) => {
                ctx.data_wb.pop_save_point().unwrap();
                ctx.meta_wb.pop_save_point().unwrap();
                (resp, true)
            }
            Err(e) => {
                // Clear dirty writes of the failed command.
                ctx.data_wb.rollback_to_save_point().unwrap();
                ctx.meta_wb.rollback_to_save_point().unwrap();
                match e {
                    Error::StaleEpoch(..) => debug!(
                        ctx.logger,
                        "stale epoch";
                        "shard_id" => self.shard_id(),
                        "peer_id" => self.id(),
                        "err" => %e,
                    ),
                    _ => warn!(
                        ctx.logger,
                        "execute raft command failed";
                        "shard_id" => self.shard_id(),
                        "peer_id" => self.id(),
                        "err" => %e,
                    ),
                }
                (cmd_resp::new_error(e), false)
            }
        };

        self.apply_state.applied_index = index;
        self.applied_term = term;
        (resp, ok)
    }

    fn exec_raft_cmd<E: KvEngine>(
        &mut self,
        ctx: &mut ApplyContext<'_, E>,
        req: &CmdRequest,
    ) -> Result<CmdResponse> {
        util::check_shard_epoch(req, &self.shard)?;
        if req.has_admin_request() {
            self.exec_admin_cmd(ctx, req.admin_request())
        } else {
            self.exec_write_cmd(ctx, &req.requests)
        }
    }

    fn exec_admin_cmd<E: KvEngine>(
        &mut self,
        ctx: &mut ApplyContext<'_, E>,
        req: &AdminRequest,
    ) -> Result<CmdResponse> {
        let cmd_type = req.cmd_type();
        info!(
            ctx.logger,
            "execute admin command";
            "shard_id" => self.shard_id(),
            "peer_id" => self.id(),
            "term" => self.term,
            "command" => ?cmd_type,
        );

        let admin_resp = match cmd_type {
            AdminCmdType::ChangePeer => self.exec_change_peer(ctx, req),
            AdminCmdType::Split => self.exec_split(ctx, req),
            AdminCmdType::Merge => self.exec_merge(ctx, req),
            AdminCmdType::CompactLog => self.exec_compact_log(req),
            AdminCmdType::InvalidAdmin => Err(box_err!("unsupported admin command type")),
        }?;

        let mut resp = CmdResponse::default();
        resp.admin_response = Some(admin_resp);
        Ok(resp)
    }

    fn exec_write_cmd<E: KvEngine>(
        &mut self,
        ctx: &mut ApplyContext<'_, E>,
        requests: &[Request],
    ) -> Result<CmdResponse> {
        let group = self.shard.group;
        let mut responses = Vec::with_capacity(requests.len());
        for req in requests {
            let cmd_type = req.cmd_type();
            let mut resp = Response {
                cmd_type: cmd_type as i32,
                ..Default::default()
            };
            match cmd_type {
                CmdType::Put => {
                    let put = req.put.as_ref().ok_or_else(|| -> Error { box_err!("missing put") })?;
                    util::check_key_in_shard(&put.key, &self.shard)?;
                    let key = keys::data_key(group, &put.key);
                    self.metrics.written_bytes += (key.len() + put.value.len()) as u64;
                    self.metrics.written_keys += 1;
                    self.metrics.size_diff_hint += (key.len() + put.value.len()) as i64;
                    ctx.data_wb.put(&key, &put.value).unwrap_or_else(|e| {
                        panic!(
                            "{} failed to write key {}: {:?}",
                            self.tag,
                            hex::encode_upper(&put.key),
                            e
                        )
                    });
                }
                CmdType::Delete => {
                    let delete = req
                        .delete
                        .as_ref()
                        .ok_or_else(|| -> Error { box_err!("missing delete") })?;
                    util::check_key_in_shard(&delete.key, &self.shard)?;
                    let key = keys::data_key(group, &delete.key);
                    self.metrics.size_diff_hint -= key.len() as i64;
                    self.metrics.delete_keys_hint += 1;
                    ctx.data_wb.delete(&key).unwrap_or_else(|e| {
                        panic!(
                            "{} failed to delete key {}: {:?}",
                            self.tag,
                            hex::encode_upper(&delete.key),
                            e
                        )
                    });
                }
                CmdType::DeleteRange => {
                    let dr = req
                        .delete_range
                        .as_ref()
                        .ok_or_else(|| -> Error { box_err!("missing delete range") })?;
                    util::check_key_in_shard(&dr.start_key, &self.shard)?;
                    if !dr.end_key.is_empty() {
                        // The end is exclusive; it may sit on the shard
                        // boundary itself.
                        if !self.shard.end_key.is_empty()
                            && dr.end_key.as_slice() > self.shard.end_key.as_slice()
                        {
                            return Err(Error::KeyOutOfRange(
                                dr.end_key.clone(),
                                self.shard.clone(),
                            ));
                        }
                    }
                    let start = keys::data_key(group, &dr.start_key);
                    let end = if dr.end_key.is_empty() {
                        keys::enc_end_key(&self.shard)
                    } else {
                        keys::data_key(group, &dr.end_key)
                    };
                    ctx.data_wb.delete_range(&start, &end).unwrap_or_else(|e| {
                        panic!("{} failed to delete range: {:?}", self.tag, e)
                    });
                }
                CmdType::Get => {
                    let get = req.get.as_ref().ok_or_else(|| -> Error { box_err!("missing get") })?;
                    util::check_key_in_shard(&get.key, &self.shard)?;
                    let key = keys::data_key(group, &get.key);
                    let value = ctx
                        .engines
                        .data
                        .get_value(&key)
                        .unwrap_or_else(|e| {
                            panic!(
                                "{} failed to get key {}: {:?}",
                                self.tag,
                                hex::encode_upper(&get.key),
                                e
                            )
                        });
                    resp.get = Some(GetResponse {
                        found: value.is_some(),
                        value: value.unwrap_or_default(),
                    });
                }
                CmdType::Invalid => return Err(box_err!("invalid cmd type")),
            }
            responses.push(resp);
        }
        let mut resp = CmdResponse::default();
        resp.responses = responses;
        Ok(resp)
    }

    fn exec_change_peer<E: KvEngine>(
        &mut self,
        ctx: &mut ApplyContext<'_, E>,
        req: &AdminRequest,
    ) -> Result<AdminResponse> {
        let request = req
            .change_peer
            .as_ref()
            .ok_or_else(|| -> Error { box_err!("missing change peer request") })?;
        let peer = request
            .peer
            .clone()
            .ok_or_else(|| -> Error { box_err!("missing peer in change peer request") })?;
        let change_type = request.change_type();
        let mut shard = self.shard.clone();

        match change_type {
            PeerChangeType::AddNode => {
                if let Some(p) = shard.peers.iter_mut().find(|p| p.id == peer.id) {
                    // Promote an existing learner.
                    p.role = PeerRole::Voter as i32;
                } else {
                    if util::find_peer(&shard, peer.store_id).is_some() {
                        return Err(box_err!(
                            "store {} already has a peer of shard {}",
                            peer.store_id,
                            shard.id
                        ));
                    }
                    shard.peers.push(peer.clone());
                }
            }
            PeerChangeType::AddLearnerNode => {
                if util::find_peer_by_id(&shard, peer.id).is_some() {
                    return Err(box_err!(
                        "peer {} already exists in shard {}",
                        peer.id,
                        shard.id
                    ));
                }
                let mut learner = peer.clone();
                learner.role = PeerRole::Learner as i32;
                shard.peers.push(learner);
            }
            PeerChangeType::RemoveNode => {
                match util::remove_peer(&mut shard, peer.store_id) {
                    Some(removed) if removed.id == peer.id => {
                        if peer.id == self.peer_id {
                            self.pending_remove = true;
                        }
                    }
                    _ => {
                        return Err(box_err!(
                            "remove missing peer {} from shard {}",
                            peer.id,
                            shard.id
                        ));
                    }
                }
            }
        }

        shard.mut_epoch().conf_version += 1;
        info!(
            ctx.logger,
            "conf change applied";
            "shard_id" => shard.id,
            "peer_id" => self.peer_id,
            "change_type" => ?change_type,
            "epoch" => ?shard.epoch(),
        );

        let state = if self.pending_remove {
            PeerState::Tombstone
        } else {
            PeerState::Normal
        };
        write_shard_state(&mut ctx.meta_wb, &shard, state, &self.tag);

        self.shard = shard.clone();
        self.exec_results.push(ExecResult::ChangePeer {
            shard: shard.clone(),
            changes: vec![request.clone()],
            conf_change: ConfChange::default(),
        });

        Ok(AdminResponse {
            cmd_type: AdminCmdType::ChangePeer as i32,
            shards: vec![shard],
        })
    }

    fn exec_split<E: KvEngine>(
        &mut self,
        ctx: &mut ApplyContext<'_, E>,
        req: &AdminRequest,
    ) -> Result<AdminResponse> {
        fail_point!("apply_before_split");

        let split = req
            .split
            .as_ref()
            .ok_or_else(|| -> Error { box_err!("missing split request") })?;
        if split.split_key.is_empty() {
            return Err(box_err!("missing split key"));
        }
        if split.split_key.as_slice() == self.shard.start_key.as_slice() {
            return Err(box_err!("split key equals shard start key"));
        }
        util::check_key_in_shard(&split.split_key, &self.shard)?;
        if split.new_peer_ids.len() != self.shard.peers.len() {
            return Err(box_err!(
                "invalid new peer id count, need {}, but got {}",
                self.shard.peers.len(),
                split.new_peer_ids.len()
            ));
        }

        info!(
            ctx.logger,
            "split shard";
            "shard_id" => self.shard_id(),
            "peer_id" => self.id(),
            "split_key" => hex::encode_upper(&split.split_key),
            "new_shard_id" => split.new_shard_id,
        );

        // The left half keeps the parent identity, the right half takes
        // the ids allocated by the placement driver. Both sides advance
        // the range version.
        let mut derived = self.shard.clone();
        let new_version = derived.epoch().version + 1;
        derived.mut_epoch().version = new_version;

        let mut new_shard = derived.clone();
        new_shard.id = split.new_shard_id;
        new_shard.start_key = split.split_key.clone();
        new_shard.unique = String::new();
        for (peer, peer_id) in new_shard.peers.iter_mut().zip(&split.new_peer_ids) {
            peer.id = *peer_id;
            peer.initial_member = false;
        }
        derived.end_key = split.split_key.clone();

        write_shard_state(&mut ctx.meta_wb, &derived, PeerState::Normal, &self.tag);
        write_shard_state(&mut ctx.meta_wb, &new_shard, PeerState::Normal, &self.tag);
        write_initial_apply_state(&mut ctx.meta_wb, new_shard.id, &self.tag);

        self.shard = derived.clone();
        self.metrics.size_diff_hint = 0;
        self.metrics.delete_keys_hint = 0;

        let shards = vec![derived.clone(), new_shard.clone()];
        self.exec_results
            .push(ExecResult::Split { derived, new_shard });

        Ok(AdminResponse {
            cmd_type: AdminCmdType::Split as i32,
            shards,
        })
    }

    fn exec_merge<E: KvEngine>(
        &mut self,
        ctx: &mut ApplyContext<'_, E>,
        req: &AdminRequest,
    ) -> Result<AdminResponse> {
        let merge = req
            .merge
            .as_ref()
            .ok_or_else(|| -> Error { box_err!("missing merge request") })?;
        let source = merge
            .source
            .clone()
            .ok_or_else(|| -> Error { box_err!("missing merge source") })?;

        let mut shard = self.shard.clone();
        if source.end_key.as_slice() == shard.start_key.as_slice()
            && !(source.end_key.is_empty() && shard.start_key.is_empty())
        {
            shard.start_key = source.start_key.clone();
        } else if shard.end_key.as_slice() == source.start_key.as_slice()
            && !(shard.end_key.is_empty() && source.start_key.is_empty())
        {
            shard.end_key = source.end_key.clone();
        } else {
            return Err(box_err!(
                "source shard {} is not adjacent to shard {}",
                source.id,
                shard.id
            ));
        }
        let new_version = std::cmp::max(shard.epoch().version, source.epoch().version) + 1;
        shard.mut_epoch().version = new_version;

        info!(
            ctx.logger,
            "merge shard";
            "shard_id" => shard.id,
            "peer_id" => self.peer_id,
            "source_shard_id" => source.id,
            "commit" => merge.commit,
        );

        write_shard_state(&mut ctx.meta_wb, &shard, PeerState::Normal, &self.tag);

        self.shard = shard.clone();
        self.exec_results.push(ExecResult::Merge {
            shard: shard.clone(),
            source,
            commit: merge.commit,
        });

        Ok(AdminResponse {
            cmd_type: AdminCmdType::Merge as i32,
            shards: vec![shard],
        })
    }

    fn exec_compact_log(&mut self, req: &AdminRequest) -> Result<AdminResponse> {
        let compact = req
            .compact_log
            .as_ref()
            .ok_or_else(|| -> Error { box_err!("missing compact log request") })?;
        let first_index = self.apply_state.truncated().index + 1;
        if compact.compact_index <= self.apply_state.truncated().index {
            return Err(box_err!(
                "try to truncate compacted entries, compact index {}, truncated {:?}",
                compact.compact_index,
                self.apply_state.truncated()
            ));
        }
        if compact.compact_index > self.apply_state.applied_index {
            return Err(box_err!(
                "compact index {} > applied index {}",
                compact.compact_index,
                self.apply_state.applied_index
            ));
        }
        if compact.compact_term == 0 {
            return Err(box_err!("compact term missing, skip"));
        }

        let state = TruncatedState {
            index: compact.compact_index,
            term: compact.compact_term,
        };
        *self.apply_state.mut_truncated() = state;
        self.exec_results
            .push(ExecResult::CompactLog { state, first_index });

        Ok(AdminResponse {
            cmd_type: AdminCmdType::CompactLog as i32,
            shards: vec![],
        })
    }
}

/// Persists the shard's local state and descriptor in one metadata batch.
pub fn write_shard_state<W: WriteBatch>(wb: &mut W, shard: &Shard, state: PeerState, tag: &str) {
    let local_state = ShardLocalState {
        state: state as i32,
        shard: Some(shard.clone()),
    };
    wb.put_msg(&keys::local_state_key(shard.id), &local_state)
        .and_then(|_| wb.put_msg(&keys::shard_key(shard.id), shard))
        .unwrap_or_else(|e| panic!("{} failed to save shard state: {:?}", tag, e));
}

/// Seeds the apply state of a freshly created (bootstrap or split) shard.
pub fn write_initial_apply_state<W: WriteBatch>(wb: &mut W, shard_id: u64, tag: &str) {
    let apply_state = ApplyState {
        applied_index: RAFT_INIT_LOG_INDEX,
        applied_term: RAFT_INIT_LOG_TERM,
        truncated: Some(TruncatedState {
            index: RAFT_INIT_LOG_INDEX,
            term: RAFT_INIT_LOG_TERM,
        }),
    };
    wb.put_msg(&keys::apply_state_key(shard_id), &apply_state)
        .unwrap_or_else(|e| panic!("{} failed to save initial apply state: {:?}", tag, e));
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use engine_mem::MemEngine;
    use slog::o;

    use crate::cmdpb::{DeleteRangeRequest, GetRequest, PutRequest};
    use crate::metapb::{new_peer, ShardEpoch};

    use super::*;

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn test_engines() -> Engines<MemEngine> {
        let engine = MemEngine::new();
        Engines::new(engine.clone(), engine)
    }

    fn test_shard() -> Shard {
        Shard {
            id: 1,
            epoch: Some(ShardEpoch {
                version: 1,
                conf_version: 1,
            }),
            peers: vec![new_peer(2, 1)],
            ..Default::default()
        }
    }

    fn new_delegate(shard: Shard) -> ApplyDelegate {
        ApplyDelegate::from_registration(Registration {
            peer_id: 2,
            term: 6,
            apply_state: ApplyState {
                applied_index: RAFT_INIT_LOG_INDEX,
                applied_term: RAFT_INIT_LOG_TERM,
                truncated: Some(TruncatedState {
                    index: RAFT_INIT_LOG_INDEX,
                    term: RAFT_INIT_LOG_TERM,
                }),
            },
            applied_term: RAFT_INIT_LOG_TERM,
            shard,
        })
    }

    fn header(epoch: ShardEpoch) -> crate::cmdpb::RequestHeader {
        crate::cmdpb::RequestHeader {
            shard_id: 1,
            peer: Some(new_peer(2, 1)),
            epoch: Some(epoch),
        }
    }

    fn put_cmd(key: &[u8], value: &[u8], epoch: ShardEpoch) -> CmdRequest {
        CmdRequest {
            header: Some(header(epoch)),
            requests: vec![Request {
                cmd_type: CmdType::Put as i32,
                put: Some(PutRequest {
                    key: key.to_vec(),
                    value: value.to_vec(),
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn get_cmd(key: &[u8], epoch: ShardEpoch) -> CmdRequest {
        CmdRequest {
            header: Some(header(epoch)),
            requests: vec![Request {
                cmd_type: CmdType::Get as i32,
                get: Some(GetRequest { key: key.to_vec() }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn entry(index: u64, term: u64, cmd: &CmdRequest) -> Entry {
        let mut e = Entry::default();
        e.set_index(index);
        e.set_term(term);
        e.set_entry_type(EntryType::EntryNormal);
        e.set_data(cmd.encode_to_vec().into());
        e
    }

    fn capture() -> (Callback, mpsc::Receiver<CmdResponse>) {
        let (tx, rx) = mpsc::channel();
        (
            Callback::Respond(Box::new(move |resp| {
                let _ = tx.send(resp);
            })),
            rx,
        )
    }

    #[test]
    fn test_apply_put_and_resolve_pending() {
        let engines = test_engines();
        let log = logger();
        let mut delegate = new_delegate(test_shard());
        let epoch = delegate.shard().epoch();

        let (cb, rx) = capture();
        delegate.append_pending(PendingCmd::new(6, 6, cb));

        let cmd = put_cmd(b"k1", b"v1", epoch);
        let mut ctx = ApplyContext::new(1, &engines, &log);
        delegate.handle_raft_committed_entries(&mut ctx, 6, vec![entry(6, 6, &cmd)]);
        let res = ctx.finish_for(&mut delegate);

        assert_eq!(res.apply_state.applied_index, 6);
        assert_eq!(res.applied_term, 6);
        assert!(res.metrics.written_keys > 0);

        let resp = rx.try_recv().unwrap();
        assert!(!resp.has_error(), "{:?}", resp.error());

        // Data and apply state are both durable.
        let value = engines
            .data
            .get_value(&keys::data_key(0, b"k1"))
            .unwrap()
            .unwrap();
        assert_eq!(value, b"v1".to_vec());
        let persisted: ApplyState = engines
            .meta
            .get_msg(&keys::apply_state_key(1))
            .unwrap()
            .unwrap();
        assert_eq!(persisted.applied_index, 6);
    }

    #[test]
    fn test_get_observes_earlier_entry_in_batch() {
        let engines = test_engines();
        let log = logger();
        let mut delegate = new_delegate(test_shard());
        let epoch = delegate.shard().epoch();

        let (cb, rx) = capture();
        delegate.append_pending(PendingCmd::new(7, 6, cb));

        let put = put_cmd(b"k1", b"v1", epoch);
        let get = get_cmd(b"k1", epoch);
        let mut ctx = ApplyContext::new(1, &engines, &log);
        delegate.handle_raft_committed_entries(
            &mut ctx,
            6,
            vec![entry(6, 6, &put), entry(7, 6, &get)],
        );
        ctx.finish_for(&mut delegate);

        let resp = rx.try_recv().unwrap();
        let get_resp = resp.responses[0].get.as_ref().unwrap();
        assert!(get_resp.found);
        assert_eq!(get_resp.value, b"v1".to_vec());
    }

    #[test]
    fn test_key_out_of_range_is_refused_but_advances() {
        let engines = test_engines();
        let log = logger();
        let mut shard = test_shard();
        shard.start_key = b"b".to_vec();
        shard.end_key = b"d".to_vec();
        let epoch = shard.epoch();
        let mut delegate = new_delegate(shard);

        let (cb, rx) = capture();
        delegate.append_pending(PendingCmd::new(6, 6, cb));
        let cmd = put_cmd(b"z", b"v", epoch);
        let mut ctx = ApplyContext::new(1, &engines, &log);
        delegate.handle_raft_committed_entries(&mut ctx, 6, vec![entry(6, 6, &cmd)]);
        let res = ctx.finish_for(&mut delegate);

        let resp = rx.try_recv().unwrap();
        assert!(resp.error().unwrap().key_out_of_range.is_some());
        assert_eq!(res.apply_state.applied_index, 6);
        assert_eq!(engines.data.get_value(&keys::data_key(0, b"z")).unwrap(), None);
    }

    #[test]
    fn test_stale_epoch_admin_is_refused_but_advances() {
        let engines = test_engines();
        let log = logger();
        let mut delegate = new_delegate(test_shard());

        let stale = ShardEpoch {
            version: 0,
            conf_version: 1,
        };
        let cmd = CmdRequest {
            header: Some(header(stale)),
            admin_request: Some(AdminRequest {
                cmd_type: AdminCmdType::Split as i32,
                split: Some(crate::cmdpb::SplitRequest {
                    split_key: b"m".to_vec(),
                    new_shard_id: 10,
                    new_peer_ids: vec![11],
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let (cb, rx) = capture();
        delegate.append_pending(PendingCmd::new(6, 6, cb));
        let mut ctx = ApplyContext::new(1, &engines, &log);
        delegate.handle_raft_committed_entries(&mut ctx, 6, vec![entry(6, 6, &cmd)]);
        let res = ctx.finish_for(&mut delegate);

        let resp = rx.try_recv().unwrap();
        assert!(resp.error().unwrap().stale_epoch.is_some());
        assert_eq!(res.apply_state.applied_index, 6);
        assert!(res.exec_results.is_empty());
    }

    #[test]
    fn test_split_produces_sibling_shards() {
        let engines = test_engines();
        let log = logger();
        let mut delegate = new_delegate(test_shard());
        let epoch = delegate.shard().epoch();

        let cmd = CmdRequest {
            header: Some(header(epoch)),
            admin_request: Some(AdminRequest {
                cmd_type: AdminCmdType::Split as i32,
                split: Some(crate::cmdpb::SplitRequest {
                    split_key: b"m".to_vec(),
                    new_shard_id: 10,
                    new_peer_ids: vec![11],
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut ctx = ApplyContext::new(1, &engines, &log);
        delegate.handle_raft_committed_entries(&mut ctx, 6, vec![entry(6, 6, &cmd)]);
        let res = ctx.finish_for(&mut delegate);

        let (derived, new_shard) = match &res.exec_results[0] {
            ExecResult::Split { derived, new_shard } => (derived.clone(), new_shard.clone()),
            other => panic!("expect split result, got {:?}", other),
        };
        assert_eq!(derived.id, 1);
        assert_eq!(derived.end_key, b"m".to_vec());
        assert_eq!(new_shard.id, 10);
        assert_eq!(new_shard.start_key, b"m".to_vec());
        assert!(new_shard.end_key.is_empty());
        assert_eq!(derived.epoch().version, 2);
        assert_eq!(new_shard.epoch().version, 2);
        assert_eq!(new_shard.peers[0].id, 11);

        // Both descriptors and the child's initial apply state are
        // persisted.
        let left: ShardLocalState = engines
            .meta
            .get_msg(&keys::local_state_key(1))
            .unwrap()
            .unwrap();
        let right: ShardLocalState = engines
            .meta
            .get_msg(&keys::local_state_key(10))
            .unwrap()
            .unwrap();
        assert_eq!(left.shard().end_key, b"m".to_vec());
        assert_eq!(right.shard().start_key, b"m".to_vec());
        let child_state: ApplyState = engines
            .meta
            .get_msg(&keys::apply_state_key(10))
            .unwrap()
            .unwrap();
        assert_eq!(child_state.applied_index, RAFT_INIT_LOG_INDEX);
    }

    #[test]
    fn test_change_peer_bumps_conf_version() {
        let engines = test_engines();
        let log = logger();
        let mut delegate = new_delegate(test_shard());
        let epoch = delegate.shard().epoch();

        let cmd = CmdRequest {
            header: Some(header(epoch)),
            admin_request: Some(AdminRequest {
                cmd_type: AdminCmdType::ChangePeer as i32,
                change_peer: Some(ChangePeerRequest {
                    change_type: PeerChangeType::AddNode as i32,
                    peer: Some(new_peer(4, 2)),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut ctx = ApplyContext::new(1, &engines, &log);
        delegate.handle_raft_committed_entries(&mut ctx, 6, vec![entry(6, 6, &cmd)]);
        let res = ctx.finish_for(&mut delegate);

        match &res.exec_results[0] {
            ExecResult::ChangePeer { shard, changes, .. } => {
                assert_eq!(shard.epoch().conf_version, 2);
                assert_eq!(shard.peers.len(), 2);
                assert_eq!(changes.len(), 1);
            }
            other => panic!("expect change peer result, got {:?}", other),
        }
    }

    #[test]
    fn test_remove_self_goes_tombstone() {
        let engines = test_engines();
        let log = logger();
        let mut delegate = new_delegate(test_shard());
        let epoch = delegate.shard().epoch();

        let cmd = CmdRequest {
            header: Some(header(epoch)),
            admin_request: Some(AdminRequest {
                cmd_type: AdminCmdType::ChangePeer as i32,
                change_peer: Some(ChangePeerRequest {
                    change_type: PeerChangeType::RemoveNode as i32,
                    peer: Some(new_peer(2, 1)),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut ctx = ApplyContext::new(1, &engines, &log);
        delegate.handle_raft_committed_entries(&mut ctx, 6, vec![entry(6, 6, &cmd)]);
        ctx.finish_for(&mut delegate);

        assert!(delegate.is_pending_remove());
        let state: ShardLocalState = engines
            .meta
            .get_msg(&keys::local_state_key(1))
            .unwrap()
            .unwrap();
        assert_eq!(state.state(), PeerState::Tombstone);
    }

    #[test]
    fn test_change_peer_superseded_replies_stale() {
        let log = logger();
        let mut delegate = new_delegate(test_shard());
        let (cb1, rx1) = capture();
        let (cb2, rx2) = capture();
        delegate.set_pending_change_peer(PendingCmd::new(6, 6, cb1), &log);
        delegate.set_pending_change_peer(PendingCmd::new(7, 6, cb2), &log);

        let resp = rx1.try_recv().unwrap();
        assert!(resp.error().unwrap().stale_command);
        assert!(rx2.try_recv().is_err());
        delegate.notify_destroyed(&log);
        assert!(rx2.try_recv().unwrap().error().unwrap().shard_not_found.is_some());
    }

    #[test]
    fn test_timeout_sweep() {
        let log = logger();
        let mut delegate = new_delegate(test_shard());
        let (cb, rx) = capture();
        let mut cmd = PendingCmd::new(6, 6, cb);
        cmd.deadline = Some(Instant::now() - Duration::from_millis(1));
        delegate.append_pending(cmd);

        let (cb_live, rx_live) = capture();
        let mut live = PendingCmd::new(7, 6, cb_live);
        live.deadline = Some(Instant::now() + Duration::from_secs(60));
        delegate.append_pending(live);

        delegate.sweep_timeouts(Instant::now());
        assert!(rx.try_recv().unwrap().error().unwrap().timeout);
        assert!(rx_live.try_recv().is_err());
        delegate.notify_destroyed(&log);
    }

    #[test]
    fn test_compact_log_moves_truncated_state() {
        let engines = test_engines();
        let log = logger();
        let mut delegate = new_delegate(test_shard());
        let epoch = delegate.shard().epoch();

        // Apply a data entry first so there is something to compact.
        let put = put_cmd(b"k", b"v", epoch);
        let compact = CmdRequest {
            header: Some(header(epoch)),
            admin_request: Some(AdminRequest {
                cmd_type: AdminCmdType::CompactLog as i32,
                compact_log: Some(crate::cmdpb::CompactLogRequest {
                    compact_index: 6,
                    compact_term: 6,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut ctx = ApplyContext::new(1, &engines, &log);
        delegate.handle_raft_committed_entries(
            &mut ctx,
            6,
            vec![entry(6, 6, &put), entry(7, 6, &compact)],
        );
        let res = ctx.finish_for(&mut delegate);

        assert_eq!(res.apply_state.truncated().index, 6);
        let found = res.exec_results.iter().any(|r| {
            matches!(
                r,
                ExecResult::CompactLog { state, first_index }
                    if state.index == 6 && *first_index == 6
            )
        });
        assert!(found);
    }

    #[test]
    fn test_delete_range_within_shard() {
        let engines = test_engines();
        let log = logger();
        let mut delegate = new_delegate(test_shard());
        let epoch = delegate.shard().epoch();

        engines.data.put_value(&keys::data_key(0, b"a"), b"1");
        engines.data.put_value(&keys::data_key(0, b"b"), b"2");
        engines.data.put_value(&keys::data_key(0, b"c"), b"3");

        let cmd = CmdRequest {
            header: Some(header(epoch)),
            requests: vec![Request {
                cmd_type: CmdType::DeleteRange as i32,
                delete_range: Some(DeleteRangeRequest {
                    start_key: b"a".to_vec(),
                    end_key: b"c".to_vec(),
                }),
                ..Default::default()
            }],
            ..Default::default()
        };
        let mut ctx = ApplyContext::new(1, &engines, &log);
        delegate.handle_raft_committed_entries(&mut ctx, 6, vec![entry(6, 6, &cmd)]);
        ctx.finish_for(&mut delegate);

        assert_eq!(engines.data.get_value(&keys::data_key(0, b"a")).unwrap(), None);
        assert_eq!(engines.data.get_value(&keys::data_key(0, b"b")).unwrap(), None);
        assert!(engines.data.get_value(&keys::data_key(0, b"c")).unwrap().is_some());
    }
}
