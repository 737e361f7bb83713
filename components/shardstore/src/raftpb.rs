//! Persisted per-shard raft bookkeeping and the snapshot header.

use crate::metapb::Shard;

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct TruncatedState {
    #[prost(uint64, tag = "1")]
    pub index: u64,
    #[prost(uint64, tag = "2")]
    pub term: u64,
}

/// Apply progress of the shard state machine. Invariant:
/// `applied_index >= truncated.index`.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct ApplyState {
    #[prost(uint64, tag = "1")]
    pub applied_index: u64,
    #[prost(uint64, tag = "2")]
    pub applied_term: u64,
    #[prost(message, optional, tag = "3")]
    pub truncated: Option<TruncatedState>,
}

impl ApplyState {
    pub fn truncated(&self) -> TruncatedState {
        self.truncated.unwrap_or_default()
    }

    pub fn mut_truncated(&mut self) -> &mut TruncatedState {
        self.truncated.get_or_insert_with(TruncatedState::default)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum PeerState {
    /// Serving normally.
    Normal = 0,
    /// An inbound snapshot is being installed.
    Applying = 1,
    /// Destroyed. Terminal; the replica must not be activated again.
    Tombstone = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ShardLocalState {
    #[prost(enumeration = "PeerState", tag = "1")]
    pub state: i32,
    #[prost(message, optional, tag = "2")]
    pub shard: Option<Shard>,
}

impl ShardLocalState {
    pub fn shard(&self) -> &Shard {
        self.shard.as_ref().expect("local state without shard")
    }
}

/// Raft hard state plus the last appended log index, persisted in the
/// metadata store alongside the log itself.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct RaftLocalState {
    #[prost(uint64, tag = "1")]
    pub term: u64,
    #[prost(uint64, tag = "2")]
    pub vote: u64,
    #[prost(uint64, tag = "3")]
    pub commit: u64,
    #[prost(uint64, tag = "4")]
    pub last_index: u64,
}

/// Carried in `Snapshot.Data`; the payload itself is transferred
/// out-of-band by the snapshot manager and addressed by
/// `(shard_id, term, index)`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SnapshotHeader {
    #[prost(message, optional, tag = "1")]
    pub shard: Option<Shard>,
    #[prost(uint64, tag = "2")]
    pub term: u64,
    #[prost(uint64, tag = "3")]
    pub index: u64,
}

impl SnapshotHeader {
    pub fn shard(&self) -> &Shard {
        self.shard.as_ref().expect("snapshot header without shard")
    }
}
