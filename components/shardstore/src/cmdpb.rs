//! The command protocol carried in raft log entries.
//!
//! A `CmdRequest` is either a batch of data requests or a single admin
//! request, never both. The header's epoch is the one observed at propose
//! time and is re-validated at apply time.

use crate::metapb::{Peer, Shard, ShardEpoch};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum CmdType {
    Invalid = 0,
    Get = 1,
    Put = 2,
    Delete = 3,
    DeleteRange = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub value: Vec<u8>,
    #[prost(bool, tag = "2")]
    pub found: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PutRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteRangeRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub start_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub end_key: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Request {
    #[prost(enumeration = "CmdType", tag = "1")]
    pub cmd_type: i32,
    #[prost(message, optional, tag = "2")]
    pub get: Option<GetRequest>,
    #[prost(message, optional, tag = "3")]
    pub put: Option<PutRequest>,
    #[prost(message, optional, tag = "4")]
    pub delete: Option<DeleteRequest>,
    #[prost(message, optional, tag = "5")]
    pub delete_range: Option<DeleteRangeRequest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Response {
    #[prost(enumeration = "CmdType", tag = "1")]
    pub cmd_type: i32,
    #[prost(message, optional, tag = "2")]
    pub get: Option<GetResponse>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum AdminCmdType {
    InvalidAdmin = 0,
    ChangePeer = 1,
    Split = 2,
    Merge = 3,
    CompactLog = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ::prost::Enumeration)]
#[repr(i32)]
pub enum PeerChangeType {
    AddNode = 0,
    RemoveNode = 1,
    AddLearnerNode = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ChangePeerRequest {
    #[prost(enumeration = "PeerChangeType", tag = "1")]
    pub change_type: i32,
    #[prost(message, optional, tag = "2")]
    pub peer: Option<Peer>,
}

/// Split ids come from the placement driver via `AskSplit`; the left half
/// keeps the parent id, the right half takes `new_shard_id`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SplitRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub split_key: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub new_shard_id: u64,
    #[prost(uint64, repeated, tag = "3")]
    pub new_peer_ids: Vec<u64>,
}

/// The target absorbs the source shard's range. The source replica is
/// tombstoned only once its applied index has reached `commit`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MergeRequest {
    #[prost(message, optional, tag = "1")]
    pub source: Option<Shard>,
    #[prost(uint64, tag = "2")]
    pub commit: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CompactLogRequest {
    #[prost(uint64, tag = "1")]
    pub compact_index: u64,
    #[prost(uint64, tag = "2")]
    pub compact_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminRequest {
    #[prost(enumeration = "AdminCmdType", tag = "1")]
    pub cmd_type: i32,
    #[prost(message, optional, tag = "2")]
    pub change_peer: Option<ChangePeerRequest>,
    #[prost(message, optional, tag = "3")]
    pub split: Option<SplitRequest>,
    #[prost(message, optional, tag = "4")]
    pub merge: Option<MergeRequest>,
    #[prost(message, optional, tag = "5")]
    pub compact_log: Option<CompactLogRequest>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AdminResponse {
    #[prost(enumeration = "AdminCmdType", tag = "1")]
    pub cmd_type: i32,
    #[prost(message, repeated, tag = "2")]
    pub shards: Vec<Shard>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RequestHeader {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(message, optional, tag = "2")]
    pub peer: Option<Peer>,
    #[prost(message, optional, tag = "3")]
    pub epoch: Option<ShardEpoch>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CmdRequest {
    #[prost(message, optional, tag = "1")]
    pub header: Option<RequestHeader>,
    #[prost(message, repeated, tag = "2")]
    pub requests: Vec<Request>,
    #[prost(message, optional, tag = "3")]
    pub admin_request: Option<AdminRequest>,
}

impl CmdRequest {
    pub fn has_admin_request(&self) -> bool {
        self.admin_request.is_some()
    }

    pub fn admin_request(&self) -> &AdminRequest {
        self.admin_request.as_ref().expect("not an admin request")
    }

    pub fn header(&self) -> &RequestHeader {
        self.header.as_ref().expect("request without header")
    }
}

// Errors mirrored back to clients; see the store error type for the
// user-visible taxonomy.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct NotLeader {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
    #[prost(message, optional, tag = "2")]
    pub leader: Option<Peer>,
}

#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct ShardNotFound {
    #[prost(uint64, tag = "1")]
    pub shard_id: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StaleEpoch {
    #[prost(message, optional, tag = "1")]
    pub current_epoch: Option<ShardEpoch>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyOutOfRange {
    #[prost(bytes = "vec", tag = "1")]
    pub key: Vec<u8>,
    #[prost(uint64, tag = "2")]
    pub shard_id: u64,
    #[prost(bytes = "vec", tag = "3")]
    pub start_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "4")]
    pub end_key: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CmdError {
    #[prost(string, tag = "1")]
    pub message: String,
    #[prost(message, optional, tag = "2")]
    pub not_leader: Option<NotLeader>,
    #[prost(message, optional, tag = "3")]
    pub shard_not_found: Option<ShardNotFound>,
    #[prost(message, optional, tag = "4")]
    pub stale_epoch: Option<StaleEpoch>,
    #[prost(bool, tag = "5")]
    pub stale_command: bool,
    #[prost(message, optional, tag = "6")]
    pub key_out_of_range: Option<KeyOutOfRange>,
    #[prost(bool, tag = "7")]
    pub timeout: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResponseHeader {
    #[prost(message, optional, tag = "1")]
    pub error: Option<CmdError>,
    #[prost(uint64, tag = "2")]
    pub current_term: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CmdResponse {
    #[prost(message, optional, tag = "1")]
    pub header: Option<ResponseHeader>,
    #[prost(message, repeated, tag = "2")]
    pub responses: Vec<Response>,
    #[prost(message, optional, tag = "3")]
    pub admin_response: Option<AdminResponse>,
}

impl CmdResponse {
    pub fn error(&self) -> Option<&CmdError> {
        self.header.as_ref().and_then(|h| h.error.as_ref())
    }

    pub fn has_error(&self) -> bool {
        self.error().is_some()
    }
}
