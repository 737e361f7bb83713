//! Cluster metadata messages: shards, peers, stores.
//!
//! A shard owns the key range `[start_key, end_key)`; empty bytes stand
//! for the unbounded ends. Within one group the live shards partition the
//! whole key space.

/// The optimistic-concurrency token for admin operations. `version`
/// advances on range changes (split, merge), `conf_version` on peer-set
/// changes.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct ShardEpoch {
    #[prost(uint64, tag = "1")]
    pub conf_version: u64,
    #[prost(uint64, tag = "2")]
    pub version: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum PeerRole {
    Voter = 0,
    Learner = 1,
}

/// One raft member of a shard.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Peer {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(uint64, tag = "2")]
    pub store_id: u64,
    /// Set on the peers a shard is created with, as opposed to peers added
    /// later by conf change.
    #[prost(bool, tag = "3")]
    pub initial_member: bool,
    #[prost(enumeration = "PeerRole", tag = "4")]
    pub role: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Shard {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub start_key: Vec<u8>,
    #[prost(bytes = "vec", tag = "3")]
    pub end_key: Vec<u8>,
    #[prost(message, optional, tag = "4")]
    pub epoch: Option<ShardEpoch>,
    #[prost(message, repeated, tag = "5")]
    pub peers: Vec<Peer>,
    /// Routing group: groups partition the key space into independent
    /// routing trees.
    #[prost(uint64, tag = "6")]
    pub group: u64,
    /// Dedup token for shards created through the placement driver.
    #[prost(string, tag = "7")]
    pub unique: String,
    /// Placement-rule groups this shard is matched against.
    #[prost(string, repeated, tag = "8")]
    pub rule_groups: Vec<String>,
}

impl Shard {
    pub fn epoch(&self) -> ShardEpoch {
        self.epoch.unwrap_or_default()
    }

    pub fn mut_epoch(&mut self) -> &mut ShardEpoch {
        self.epoch.get_or_insert_with(ShardEpoch::default)
    }
}

#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct StoreLabel {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// A process hosting shard replicas.
#[derive(Clone, PartialEq, Eq, ::prost::Message)]
pub struct Store {
    #[prost(uint64, tag = "1")]
    pub id: u64,
    #[prost(string, tag = "2")]
    pub address: String,
    #[prost(message, repeated, tag = "3")]
    pub labels: Vec<StoreLabel>,
}

/// Identity of a bootstrapped store, persisted under a well-known
/// metadata key.
#[derive(Clone, Copy, PartialEq, Eq, ::prost::Message)]
pub struct StoreIdent {
    #[prost(uint64, tag = "1")]
    pub cluster_id: u64,
    #[prost(uint64, tag = "2")]
    pub store_id: u64,
}

pub fn new_peer(id: u64, store_id: u64) -> Peer {
    Peer {
        id,
        store_id,
        ..Default::default()
    }
}

pub fn new_learner_peer(id: u64, store_id: u64) -> Peer {
    Peer {
        id,
        store_id,
        role: PeerRole::Learner as i32,
        ..Default::default()
    }
}
