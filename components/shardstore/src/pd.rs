//! Placement driver client surface.
//!
//! The placement driver is the cluster controller: it allocates ids,
//! tracks shards and stores, schedules replica placement and answers
//! split requests. Stores talk to it through the [`PlacementDriver`]
//! trait; [`MemPlacementDriver`] is a complete in-process implementation
//! used by tests and embedded single-process clusters. The RPC wire
//! format of a remote driver is out of scope here.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::errors::Result;
use crate::metapb::{new_peer, Peer, Shard, ShardEpoch, Store};
use crate::store::util;
use crate::box_err;

/// Placement-side lifecycle of a shard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShardPlacementState {
    Creating,
    Running,
}

/// A placement decision piggybacked on a shard heartbeat response. The
/// leader turns it into a change-peer admin proposal.
#[derive(Clone, Debug)]
pub enum HeartbeatAction {
    AddPeer(Peer),
    RemovePeer(Peer),
}

/// `key` must take one of `values` on the target store's labels.
#[derive(Clone, Debug)]
pub struct LabelConstraint {
    pub key: String,
    pub values: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct PlacementRule {
    pub group_id: String,
    pub id: String,
    pub count: usize,
    pub label_constraints: Vec<LabelConstraint>,
}

/// Eagerly pre-allocated shards under a range prefix.
#[derive(Clone, Debug)]
pub struct PoolSpec {
    pub group: u64,
    pub capacity: u64,
    pub range_prefix: Vec<u8>,
}

pub trait PlacementDriver: Send + Sync {
    fn cluster_id(&self) -> u64;

    fn alloc_id(&self) -> Result<u64>;

    /// Registers the store and, on the first call ever, the initial
    /// shards. Returns whether this call bootstrapped the cluster.
    fn bootstrap(&self, store: Store, shards: Vec<Shard>) -> Result<bool>;

    fn is_bootstrapped(&self) -> bool;

    fn put_store(&self, store: Store) -> Result<()>;

    /// Allocates the ids a leader needs to propose a split: the new
    /// shard id and one peer id per existing peer.
    fn ask_split(&self, shard: &Shard) -> Result<(u64, Vec<u64>)>;

    /// Leader-side heartbeat; the response may carry a placement
    /// decision.
    fn shard_heartbeat(
        &self,
        shard: Shard,
        leader: Peer,
        approximate_size: u64,
    ) -> Result<Option<HeartbeatAction>>;

    /// Store liveness heartbeat; returns shards scheduled for creation
    /// on this store.
    fn store_heartbeat(&self, store_id: u64) -> Result<Vec<Shard>>;

    fn report_split(&self, left: Shard, right: Shard) -> Result<()>;

    fn put_placement_rule(&self, rule: PlacementRule) -> Result<()>;

    /// Placement intent: create the given shards asynchronously on
    /// suitable stores.
    fn async_add_shards(&self, shards: Vec<Shard>) -> Result<()>;

    /// Like `async_add_shards`, but `least_peers[i]` lower-bounds the
    /// number of initial replicas shard `i` needs before it may start.
    fn async_add_shards_with_least_peers(
        &self,
        shards: Vec<Shard>,
        least_peers: Vec<usize>,
    ) -> Result<()>;

    fn create_resource_pool(&self, spec: PoolSpec) -> Result<()>;

    /// Binds one pre-created pool shard to `(purpose, key)`, reusing the
    /// existing binding if there is one.
    fn pool_alloc(&self, group: u64, purpose: u64, key: &[u8]) -> Result<Option<Shard>>;

    fn get_shard_state(&self, shard_id: u64) -> Option<ShardPlacementState>;

    fn get_shard_by_id(&self, shard_id: u64) -> Option<Shard>;
}

struct ShardRecord {
    shard: Shard,
    state: ShardPlacementState,
    /// Conf version when the last placement op was handed out; no new op
    /// until the epoch moves past it.
    last_op_conf_ver: Option<u64>,
}

struct Pool {
    shard_ids: Vec<u64>,
    allocated: HashMap<(u64, Vec<u8>), u64>,
    next: usize,
}

#[derive(Default)]
struct PdCore {
    bootstrapped: bool,
    id_alloc: u64,
    stores: HashMap<u64, Store>,
    shards: HashMap<u64, ShardRecord>,
    uniques: HashSet<String>,
    rules: Vec<PlacementRule>,
    pending_create: HashMap<u64, Vec<Shard>>,
    pools: HashMap<u64, Pool>,
}

impl PdCore {
    fn alloc(&mut self) -> u64 {
        self.id_alloc += 1;
        self.id_alloc
    }

    fn store_matches(&self, store: &Store, constraints: &[LabelConstraint]) -> bool {
        constraints.iter().all(|c| {
            store
                .labels
                .iter()
                .any(|l| l.key == c.key && c.values.contains(&l.value))
        })
    }

    /// Stores eligible to host the shard and the replica count it
    /// should reach.
    fn placement_of(&self, shard: &Shard, max_replicas: usize) -> (Vec<u64>, usize) {
        let matched: Vec<&PlacementRule> = self
            .rules
            .iter()
            .filter(|r| shard.rule_groups.contains(&r.group_id))
            .collect();
        if matched.is_empty() {
            let mut stores: Vec<u64> = self.stores.keys().copied().collect();
            stores.sort_unstable();
            (stores, max_replicas)
        } else {
            let mut stores: Vec<u64> = self
                .stores
                .values()
                .filter(|s| matched.iter().any(|r| self.store_matches(s, &r.label_constraints)))
                .map(|s| s.id)
                .collect();
            stores.sort_unstable();
            let count = matched.iter().map(|r| r.count).max().unwrap();
            (stores, count)
        }
    }

    fn replica_count_on(&self, store_id: u64) -> usize {
        self.shards
            .values()
            .filter(|r| util::find_peer(&r.shard, store_id).is_some())
            .count()
    }

    fn finalize_new_shard(
        &mut self,
        mut shard: Shard,
        least_peers: Option<usize>,
        max_replicas: usize,
    ) -> Result<Shard> {
        if !shard.unique.is_empty() && !self.uniques.insert(shard.unique.clone()) {
            return Err(box_err!("shard with unique {} already exists", shard.unique));
        }
        shard.id = self.alloc();
        shard.epoch = Some(ShardEpoch {
            version: util::INIT_EPOCH_VER,
            conf_version: util::INIT_EPOCH_CONF_VER,
        });
        let (candidates, count) = self.placement_of(&shard, max_replicas);
        let targets: Vec<u64> = candidates.into_iter().take(count).collect();
        if targets.is_empty() {
            return Err(box_err!("no store can host shard {}", shard.id));
        }
        if let Some(least) = least_peers {
            if targets.len() < least {
                return Err(box_err!(
                    "shard {} needs at least {} replicas, only {} stores match",
                    shard.id,
                    least,
                    targets.len()
                ));
            }
        }
        for store_id in &targets {
            let mut peer = new_peer(self.alloc(), *store_id);
            peer.initial_member = true;
            shard.peers.push(peer);
        }
        self.shards.insert(
            shard.id,
            ShardRecord {
                shard: shard.clone(),
                state: ShardPlacementState::Creating,
                last_op_conf_ver: None,
            },
        );
        for store_id in targets {
            self.pending_create
                .entry(store_id)
                .or_default()
                .push(shard.clone());
        }
        Ok(shard)
    }
}

/// In-process placement driver.
pub struct MemPlacementDriver {
    cluster_id: u64,
    max_replicas: usize,
    core: Mutex<PdCore>,
}

impl MemPlacementDriver {
    pub fn new(cluster_id: u64, max_replicas: usize) -> MemPlacementDriver {
        MemPlacementDriver {
            cluster_id,
            max_replicas,
            core: Mutex::new(PdCore::default()),
        }
    }
}

impl PlacementDriver for MemPlacementDriver {
    fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    fn alloc_id(&self) -> Result<u64> {
        Ok(self.core.lock().unwrap().alloc())
    }

    fn bootstrap(&self, store: Store, shards: Vec<Shard>) -> Result<bool> {
        let mut core = self.core.lock().unwrap();
        core.stores.insert(store.id, store);
        if core.bootstrapped {
            return Ok(false);
        }
        core.bootstrapped = true;
        for shard in shards {
            if !shard.unique.is_empty() {
                core.uniques.insert(shard.unique.clone());
            }
            core.shards.insert(
                shard.id,
                ShardRecord {
                    shard,
                    state: ShardPlacementState::Creating,
                    last_op_conf_ver: None,
                },
            );
        }
        Ok(true)
    }

    fn is_bootstrapped(&self) -> bool {
        self.core.lock().unwrap().bootstrapped
    }

    fn put_store(&self, store: Store) -> Result<()> {
        self.core.lock().unwrap().stores.insert(store.id, store);
        Ok(())
    }

    fn ask_split(&self, shard: &Shard) -> Result<(u64, Vec<u64>)> {
        let mut core = self.core.lock().unwrap();
        let new_shard_id = core.alloc();
        let new_peer_ids = shard.peers.iter().map(|_| core.alloc()).collect();
        Ok((new_shard_id, new_peer_ids))
    }

    fn shard_heartbeat(
        &self,
        shard: Shard,
        leader: Peer,
        _approximate_size: u64,
    ) -> Result<Option<HeartbeatAction>> {
        let mut core = self.core.lock().unwrap();
        let max_replicas = self.max_replicas;
        let (candidates, count) = core.placement_of(&shard, max_replicas);

        let record = core
            .shards
            .entry(shard.id)
            .or_insert_with(|| ShardRecord {
                shard: shard.clone(),
                state: ShardPlacementState::Creating,
                last_op_conf_ver: None,
            });
        // A heartbeat with an older epoch is from a lagging leader.
        let current = record.shard.epoch();
        let incoming = shard.epoch();
        if util::is_epoch_stale(incoming, current) {
            return Ok(None);
        }
        record.shard = shard.clone();
        record.state = ShardPlacementState::Running;

        if record.last_op_conf_ver == Some(incoming.conf_version) {
            // The previous decision has not applied yet.
            return Ok(None);
        }
        record.last_op_conf_ver = None;

        let hosting: Vec<u64> = shard.peers.iter().map(|p| p.store_id).collect();
        if hosting.len() < count {
            let mut free: Vec<u64> = candidates
                .into_iter()
                .filter(|s| !hosting.contains(s))
                .collect();
            if free.is_empty() {
                return Ok(None);
            }
            free.sort_by_key(|s| core.replica_count_on(*s));
            let target = free[0];
            let peer = new_peer(core.alloc(), target);
            let record = core.shards.get_mut(&shard.id).unwrap();
            record.last_op_conf_ver = Some(incoming.conf_version);
            return Ok(Some(HeartbeatAction::AddPeer(peer)));
        }
        if hosting.len() > count {
            if let Some(extra) = shard
                .peers
                .iter()
                .find(|p| p.id != leader.id && !candidates.contains(&p.store_id))
                .or_else(|| shard.peers.iter().find(|p| p.id != leader.id))
            {
                let record = core.shards.get_mut(&shard.id).unwrap();
                record.last_op_conf_ver = Some(incoming.conf_version);
                return Ok(Some(HeartbeatAction::RemovePeer(extra.clone())));
            }
        }
        Ok(None)
    }

    fn store_heartbeat(&self, store_id: u64) -> Result<Vec<Shard>> {
        let mut core = self.core.lock().unwrap();
        Ok(core.pending_create.remove(&store_id).unwrap_or_default())
    }

    fn report_split(&self, left: Shard, right: Shard) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        for shard in [left, right] {
            let state = core
                .shards
                .get(&shard.id)
                .map(|r| r.state)
                .unwrap_or(ShardPlacementState::Running);
            core.shards.insert(
                shard.id,
                ShardRecord {
                    shard,
                    state,
                    last_op_conf_ver: None,
                },
            );
        }
        Ok(())
    }

    fn put_placement_rule(&self, rule: PlacementRule) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        core.rules.retain(|r| r.id != rule.id || r.group_id != rule.group_id);
        core.rules.push(rule);
        Ok(())
    }

    fn async_add_shards(&self, shards: Vec<Shard>) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let max_replicas = self.max_replicas;
        for shard in shards {
            core.finalize_new_shard(shard, None, max_replicas)?;
        }
        Ok(())
    }

    fn async_add_shards_with_least_peers(
        &self,
        shards: Vec<Shard>,
        least_peers: Vec<usize>,
    ) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        let max_replicas = self.max_replicas;
        for (i, shard) in shards.into_iter().enumerate() {
            let least = least_peers.get(i).copied();
            core.finalize_new_shard(shard, least, max_replicas)?;
        }
        Ok(())
    }

    fn create_resource_pool(&self, spec: PoolSpec) -> Result<()> {
        let mut core = self.core.lock().unwrap();
        if core.pools.contains_key(&spec.group) {
            return Ok(());
        }
        let max_replicas = self.max_replicas;
        let mut shard_ids = Vec::with_capacity(spec.capacity as usize);
        for i in 0..spec.capacity {
            let mut start = spec.range_prefix.clone();
            start.extend_from_slice(&i.to_be_bytes());
            let mut end = spec.range_prefix.clone();
            end.extend_from_slice(&(i + 1).to_be_bytes());
            let shard = Shard {
                start_key: start,
                end_key: end,
                group: spec.group,
                unique: format!("pool-{}-{}", spec.group, i),
                ..Default::default()
            };
            let created = core.finalize_new_shard(shard, None, max_replicas)?;
            shard_ids.push(created.id);
        }
        core.pools.insert(
            spec.group,
            Pool {
                shard_ids,
                allocated: HashMap::new(),
                next: 0,
            },
        );
        Ok(())
    }

    fn pool_alloc(&self, group: u64, purpose: u64, key: &[u8]) -> Result<Option<Shard>> {
        let mut core = self.core.lock().unwrap();
        let pool = match core.pools.get_mut(&group) {
            Some(p) => p,
            None => return Ok(None),
        };
        let binding = (purpose, key.to_vec());
        let shard_id = match pool.allocated.get(&binding) {
            Some(id) => *id,
            None => {
                if pool.next >= pool.shard_ids.len() {
                    return Err(box_err!("resource pool of group {} is exhausted", group));
                }
                let id = pool.shard_ids[pool.next];
                pool.next += 1;
                pool.allocated.insert(binding, id);
                id
            }
        };
        Ok(core.shards.get(&shard_id).map(|r| r.shard.clone()))
    }

    fn get_shard_state(&self, shard_id: u64) -> Option<ShardPlacementState> {
        self.core
            .lock()
            .unwrap()
            .shards
            .get(&shard_id)
            .map(|r| r.state)
    }

    fn get_shard_by_id(&self, shard_id: u64) -> Option<Shard> {
        self.core
            .lock()
            .unwrap()
            .shards
            .get(&shard_id)
            .map(|r| r.shard.clone())
    }
}

#[cfg(test)]
mod tests {
    use crate::metapb::StoreLabel;

    use super::*;

    fn store_with_label(id: u64, key: &str, value: &str) -> Store {
        Store {
            id,
            labels: vec![StoreLabel {
                key: key.to_owned(),
                value: value.to_owned(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_bootstrap_once() {
        let pd = MemPlacementDriver::new(1, 3);
        let shard = Shard {
            id: 1,
            ..Default::default()
        };
        assert!(pd.bootstrap(store_with_label(1, "c", "0"), vec![shard.clone()]).unwrap());
        assert!(!pd.bootstrap(store_with_label(2, "c", "1"), vec![shard]).unwrap());
        assert!(pd.is_bootstrapped());
    }

    #[test]
    fn test_heartbeat_replicates_up_to_max() {
        let pd = MemPlacementDriver::new(1, 3);
        let shard = Shard {
            id: 1,
            epoch: Some(ShardEpoch {
                version: 1,
                conf_version: 1,
            }),
            peers: vec![new_peer(2, 1)],
            ..Default::default()
        };
        pd.bootstrap(store_with_label(1, "c", "0"), vec![shard.clone()]).unwrap();
        pd.put_store(store_with_label(2, "c", "1")).unwrap();
        pd.put_store(store_with_label(3, "c", "2")).unwrap();

        let action = pd
            .shard_heartbeat(shard.clone(), new_peer(2, 1), 0)
            .unwrap();
        let added = match action {
            Some(HeartbeatAction::AddPeer(p)) => p,
            other => panic!("expect add peer, got {:?}", other),
        };
        assert_ne!(added.store_id, 1);

        // Same conf version: the decision is still pending, no new op.
        assert!(pd.shard_heartbeat(shard, new_peer(2, 1), 0).unwrap().is_none());
    }

    #[test]
    fn test_async_add_with_rules() {
        let pd = MemPlacementDriver::new(1, 3);
        pd.bootstrap(store_with_label(1, "c", "0"), vec![]).unwrap();
        pd.put_store(store_with_label(2, "c", "1")).unwrap();
        pd.put_store(store_with_label(3, "c", "2")).unwrap();
        pd.put_placement_rule(PlacementRule {
            group_id: "g1".to_owned(),
            id: "id1".to_owned(),
            count: 3,
            label_constraints: vec![LabelConstraint {
                key: "c".to_owned(),
                values: vec!["0".to_owned(), "1".to_owned()],
            }],
        })
        .unwrap();

        let shard = Shard {
            start_key: b"b".to_vec(),
            end_key: b"c".to_vec(),
            unique: "abc".to_owned(),
            rule_groups: vec!["g1".to_owned()],
            ..Default::default()
        };
        pd.async_add_shards_with_least_peers(vec![shard], vec![2]).unwrap();

        // Only stores 1 and 2 match the constraint.
        let created1 = pd.store_heartbeat(1).unwrap();
        let created2 = pd.store_heartbeat(2).unwrap();
        let created3 = pd.store_heartbeat(3).unwrap();
        assert_eq!(created1.len(), 1);
        assert_eq!(created2.len(), 1);
        assert!(created3.is_empty());
        assert_eq!(created1[0].peers.len(), 2);
        assert!(created1[0].peers.iter().all(|p| p.initial_member));
    }

    #[test]
    fn test_unique_dedup() {
        let pd = MemPlacementDriver::new(1, 1);
        pd.bootstrap(store_with_label(1, "c", "0"), vec![]).unwrap();
        let shard = Shard {
            unique: "abc".to_owned(),
            ..Default::default()
        };
        pd.async_add_shards(vec![shard.clone()]).unwrap();
        assert!(pd.async_add_shards(vec![shard]).is_err());
    }

    #[test]
    fn test_resource_pool_alloc() {
        let pd = MemPlacementDriver::new(1, 1);
        pd.bootstrap(store_with_label(1, "c", "0"), vec![]).unwrap();
        pd.create_resource_pool(PoolSpec {
            group: 0,
            capacity: 2,
            range_prefix: b"b".to_vec(),
        })
        .unwrap();
        assert_eq!(pd.store_heartbeat(1).unwrap().len(), 2);

        let s1 = pd.pool_alloc(0, 0, b"k1").unwrap().unwrap();
        let again = pd.pool_alloc(0, 0, b"k1").unwrap().unwrap();
        assert_eq!(s1.id, again.id);
        let s2 = pd.pool_alloc(0, 0, b"k2").unwrap().unwrap();
        assert_ne!(s1.id, s2.id);
        assert!(pd.pool_alloc(0, 0, b"k3").is_err());
    }
}
