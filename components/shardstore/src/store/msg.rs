use std::fmt::{self, Debug, Formatter};
use std::time::Instant;

use raft::eraftpb;

use crate::cmdpb::{CmdRequest, CmdResponse};
use crate::metapb::{Peer, Shard, ShardEpoch};
use crate::store::apply::ApplyRes;

pub type CmdCallback = Box<dyn FnOnce(CmdResponse) + Send>;

/// Callback attached to a client proposal; invoked exactly once when the
/// proposal resolves (success, stale, timeout, or error).
pub enum Callback {
    /// No callback.
    None,
    /// Respond to the client with the apply outcome.
    Respond(CmdCallback),
}

impl Callback {
    pub fn invoke_with_response(self, resp: CmdResponse) {
        match self {
            Callback::None => (),
            Callback::Respond(cb) => cb(resp),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Callback::None)
    }
}

impl Debug for Callback {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Callback::None => write!(f, "Callback::None"),
            Callback::Respond(_) => write!(f, "Callback::Respond(..)"),
        }
    }
}

/// A raft message addressed to one shard replica, together with enough
/// shard metadata for the receiving store to create the replica on demand.
#[derive(Debug, Clone)]
pub struct ShardMessage {
    pub shard_id: u64,
    pub group: u64,
    pub from_peer: Peer,
    pub to_peer: Peer,
    pub epoch: ShardEpoch,
    /// Set when the sender knows itself to be tombstoned; tells the
    /// receiver the shard is gone.
    pub is_tombstone: bool,
    pub message: eraftpb::Message,
}

/// A command expected to be proposed by the shard leader.
pub struct RaftCommand {
    pub send_time: Instant,
    pub request: CmdRequest,
    pub callback: Callback,
    pub deadline: Option<Instant>,
}

impl RaftCommand {
    pub fn new(request: CmdRequest, callback: Callback) -> RaftCommand {
        RaftCommand {
            request,
            callback,
            deadline: None,
            send_time: Instant::now(),
        }
    }

    pub fn with_deadline(request: CmdRequest, callback: Callback, deadline: Instant) -> RaftCommand {
        RaftCommand {
            request,
            callback,
            deadline: Some(deadline),
            send_time: Instant::now(),
        }
    }
}

impl Debug for RaftCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "RaftCommand [shard {:?}]", self.request.header)
    }
}

/// Message that can be sent to a shard replica.
pub enum PeerMsg {
    /// Raft message between replicas of one shard.
    RaftMessage(ShardMessage),
    /// Client proposal.
    RaftCommand(RaftCommand),
    /// Periodic logical clock tick.
    Tick,
    /// Result of applying committed entries. Must not be lost.
    ApplyRes(ApplyRes),
    /// Split check finished on the split-check worker.
    SplitCheckResult {
        epoch_at_check: ShardEpoch,
        size: u64,
        split_keys: Vec<Vec<u8>>,
    },
    /// A pending leader-side snapshot finished generating.
    SnapshotGenerated,
    /// The apply-snapshot job finished (or aborted).
    SnapshotApplied {
        success: bool,
    },
    /// The destroy job finished; the store can forget the replica.
    DestroyRes {
        merged: bool,
    },
    /// Ask the replica to report a heartbeat to the placement driver.
    HeartbeatPd,
}

impl Debug for PeerMsg {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            PeerMsg::RaftMessage(_) => write!(f, "Raft Message"),
            PeerMsg::RaftCommand(_) => write!(f, "Raft Command"),
            PeerMsg::Tick => write!(f, "Tick"),
            PeerMsg::ApplyRes(res) => write!(f, "ApplyRes [shard {}]", res.shard_id),
            PeerMsg::SplitCheckResult { split_keys, .. } => {
                write!(f, "SplitCheckResult [{} keys]", split_keys.len())
            }
            PeerMsg::SnapshotGenerated => write!(f, "SnapshotGenerated"),
            PeerMsg::SnapshotApplied { success } => {
                write!(f, "SnapshotApplied [success: {}]", success)
            }
            PeerMsg::DestroyRes { merged } => write!(f, "DestroyRes [merged: {}]", merged),
            PeerMsg::HeartbeatPd => write!(f, "HeartbeatPd"),
        }
    }
}

/// Message handled by the store event loop itself.
pub enum StoreMsg {
    /// Route a peer message to one replica.
    Peer { shard_id: u64, msg: PeerMsg },
    /// A raft message whose target replica may not exist yet.
    RaftMessage(ShardMessage),
    /// Create and register a replica for a shard assigned by the
    /// placement driver or produced by a split.
    CreatePeer { shard: Shard, campaign: bool },
    /// Store-level periodic tick (heartbeats, placement polling).
    Tick,
    Stop,
}

impl Debug for StoreMsg {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreMsg::Peer { shard_id, msg } => write!(f, "Peer [{}] {:?}", shard_id, msg),
            StoreMsg::RaftMessage(m) => write!(f, "Raft Message [shard {}]", m.shard_id),
            StoreMsg::CreatePeer { shard, .. } => write!(f, "CreatePeer [shard {}]", shard.id),
            StoreMsg::Tick => write!(f, "StoreTick"),
            StoreMsg::Stop => write!(f, "Stop"),
        }
    }
}
