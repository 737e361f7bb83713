//! In-process cluster harness for the integration tests: N stores over
//! the in-process transport and placement driver, all on memory engines
//! so a "restart" is a rebuild over the surviving engines.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use engine_mem::MemEngine;
use engine_traits::Engines;
use slog::{o, Logger};
use tempfile::TempDir;

use shardstore::cmdpb::{
    CmdRequest, CmdResponse, CmdType, GetRequest, PutRequest, Request, RequestHeader,
};
use shardstore::config::Config;
use shardstore::metapb::{Shard, Store, StoreLabel};
use shardstore::pd::{MemPlacementDriver, PlacementDriver, ShardPlacementState};
use shardstore::store::{create_router, InProcessTransport, ShardStore, StoreMeta};
use shardstore::util::config::ReadableDuration;

pub const TEST_WAIT_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub type ConfigAdjust = Box<dyn Fn(usize, &mut Config)>;

pub struct TestNode {
    pub store: ShardStore<MemEngine>,
}

pub struct TestCluster {
    pub pd: Arc<MemPlacementDriver>,
    pub trans: InProcessTransport,
    nodes: Vec<Option<TestNode>>,
    engines: Vec<Engines<MemEngine>>,
    snap_dirs: Vec<TempDir>,
    adjust: Option<ConfigAdjust>,
    logger: Logger,
}

fn test_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn base_config() -> Config {
    let mut cfg = Config::default();
    cfg.raft.tick_interval = ReadableDuration::millis(10);
    cfg.raft.election_interval_ticks = 10;
    cfg.raft.heartbeat_interval_ticks = 2;
    cfg.raft.split_check_interval_ticks = 2;
    cfg.raft.log_gc_interval_ticks = 50;
    cfg.raft.pd_heartbeat_interval_ticks = 3;
    cfg
}

impl TestCluster {
    pub fn new(count: usize) -> TestCluster {
        let mut cluster = TestCluster::prepare(count);
        cluster.start_all();
        cluster
    }

    pub fn with_adjust(count: usize, adjust: ConfigAdjust) -> TestCluster {
        let mut cluster = TestCluster::prepare(count);
        cluster.set_adjust(adjust);
        cluster.start_all();
        cluster
    }

    /// Creates the engines and transport without starting any store, so
    /// tests can capture engines in their config closures first.
    pub fn prepare(count: usize) -> TestCluster {
        let pd = Arc::new(MemPlacementDriver::new(1, 3));
        let trans = InProcessTransport::default();
        let mut cluster = TestCluster {
            pd,
            trans,
            nodes: Vec::new(),
            engines: Vec::new(),
            snap_dirs: Vec::new(),
            adjust: None,
            logger: test_logger(),
        };
        for _ in 0..count {
            let engine = MemEngine::new();
            cluster.engines.push(Engines::new(engine.clone(), engine));
            cluster
                .snap_dirs
                .push(tempfile::tempdir().expect("create snap dir"));
            cluster.nodes.push(None);
        }
        cluster
    }

    pub fn set_adjust(&mut self, adjust: ConfigAdjust) {
        self.adjust = Some(adjust);
    }

    pub fn start_all(&mut self) {
        for i in 0..self.nodes.len() {
            if self.nodes[i].is_none() {
                self.start_node(i);
            }
        }
    }

    pub fn start_node(&mut self, offset: usize) {
        assert!(self.nodes[offset].is_none());
        let mut cfg = base_config();
        if let Some(adjust) = &self.adjust {
            adjust(offset, &mut cfg);
        }
        cfg.snap_dir = self.snap_dirs[offset]
            .path()
            .to_str()
            .unwrap()
            .to_owned();

        let (router, receiver) = create_router();
        let store = Store {
            address: format!("store-{}", offset),
            labels: vec![StoreLabel {
                key: "c".to_owned(),
                value: offset.to_string(),
            }],
            ..Default::default()
        };
        let store = ShardStore::start(
            store,
            cfg,
            self.engines[offset].clone(),
            self.pd.clone(),
            Arc::new(self.trans.clone()),
            router.clone(),
            receiver,
            self.logger.clone(),
        )
        .expect("start store");
        self.trans
            .register_store(store.store_id(), router, store.snap_manager().clone());
        self.nodes[offset] = Some(TestNode { store });
    }

    pub fn stop_node(&mut self, offset: usize) {
        if let Some(mut node) = self.nodes[offset].take() {
            self.trans.unregister_store(node.store.store_id());
            node.store.shutdown();
        }
    }

    pub fn restart(&mut self) {
        let count = self.nodes.len();
        for i in 0..count {
            self.stop_node(i);
        }
        for i in 0..count {
            self.start_node(i);
        }
    }

    pub fn stop(&mut self) {
        let count = self.nodes.len();
        for i in 0..count {
            self.stop_node(i);
        }
    }

    pub fn node(&self, offset: usize) -> &TestNode {
        self.nodes[offset].as_ref().expect("node is stopped")
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn meta(&self, offset: usize) -> Arc<Mutex<StoreMeta>> {
        self.node(offset).store.meta()
    }

    pub fn engines(&self, offset: usize) -> &Engines<MemEngine> {
        &self.engines[offset]
    }

    fn wait_until(&self, what: &str, timeout: Duration, mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        let mut counts = Vec::new();
        for node in self.nodes.iter().flatten() {
            let meta = node.store.meta();
            let meta = meta.lock().unwrap();
            counts.push((meta.store_id, meta.shard_count(), meta.leader_count()));
        }
        panic!(
            "condition '{}' not reached within {:?}; (store, shards, leaders): {:?}",
            what, timeout, counts
        );
    }

    pub fn wait_shard_count_per_node(&self, expect: usize, timeout: Duration) {
        self.wait_until(&format!("{} shards per node", expect), timeout, || {
            self.nodes.iter().flatten().all(|node| {
                node.store.meta().lock().unwrap().shard_count() == expect
            })
        });
    }

    pub fn wait_shard_counts(&self, expect: &[usize], timeout: Duration) {
        self.wait_until(&format!("shard counts {:?}", expect), timeout, || {
            let mut counts: Vec<usize> = self
                .nodes
                .iter()
                .flatten()
                .map(|node| node.store.meta().lock().unwrap().shard_count())
                .collect();
            counts.sort_unstable_by(|a, b| b.cmp(a));
            let mut expect = expect.to_vec();
            expect.sort_unstable_by(|a, b| b.cmp(a));
            counts == expect
        });
    }

    pub fn wait_leaders_by_count(&self, expect: usize, timeout: Duration) {
        self.wait_until(&format!("{} leaders", expect), timeout, || {
            let total: usize = self
                .nodes
                .iter()
                .flatten()
                .map(|node| node.store.meta().lock().unwrap().leader_count())
                .sum();
            total == expect
        });
    }

    pub fn wait_shard_running(&self, shard_id: u64, timeout: Duration) {
        self.wait_until(&format!("shard {} running", shard_id), timeout, || {
            self.pd.get_shard_state(shard_id) == Some(ShardPlacementState::Running)
        });
    }

    /// The shards of `group` on one node, ordered by start key.
    pub fn sorted_shards(&self, offset: usize, group: u64) -> Vec<Shard> {
        self.meta(offset).lock().unwrap().sorted_shards(group)
    }

    pub fn check_shard_range(&self, offset: usize, index: usize, start: &[u8], end: &[u8]) {
        let shards = self.sorted_shards(offset, 0);
        assert!(
            index < shards.len(),
            "no shard at index {}, have {:?}",
            index,
            shards
                .iter()
                .map(|s| (s.id, s.start_key.clone(), s.end_key.clone()))
                .collect::<Vec<_>>()
        );
        assert_eq!(shards[index].start_key, start.to_vec(), "start of shard {}", index);
        assert_eq!(shards[index].end_key, end.to_vec(), "end of shard {}", index);
    }

    fn locate_shard(&self, key: &[u8]) -> Option<(usize, Shard)> {
        for (offset, node) in self.nodes.iter().enumerate() {
            let node = match node {
                Some(n) => n,
                None => continue,
            };
            let meta = node.store.meta();
            let meta = meta.lock().unwrap();
            for shard in meta.shards.values() {
                if key >= shard.start_key.as_slice()
                    && (shard.end_key.is_empty() || key < shard.end_key.as_slice())
                    && meta.leaders.contains_key(&shard.id)
                {
                    return Some((offset, shard.clone()));
                }
            }
        }
        None
    }

    /// Routes a request to the current leader of the shard covering
    /// `key`, retrying through leadership and epoch changes.
    pub fn request(&self, key: &[u8], requests: Vec<Request>, timeout: Duration) -> CmdResponse {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                panic!("request for key {:?} timed out", key);
            }
            let (offset, shard) = match self.locate_shard(key) {
                Some(found) => found,
                None => {
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
            };
            let req = CmdRequest {
                header: Some(RequestHeader {
                    shard_id: shard.id,
                    epoch: Some(shard.epoch()),
                    ..Default::default()
                }),
                requests: requests.clone(),
                ..Default::default()
            };
            match self
                .node(offset)
                .store
                .exec_command(shard.id, req, Duration::from_secs(2))
            {
                Ok(resp) => {
                    if resp.has_error() {
                        // Stale routing; wait for the topology to settle
                        // and retry.
                        std::thread::sleep(POLL_INTERVAL);
                        continue;
                    }
                    return resp;
                }
                Err(_) => {
                    std::thread::sleep(POLL_INTERVAL);
                    continue;
                }
            }
        }
    }

    pub fn put(&self, key: &[u8], value: &[u8]) {
        self.request(
            key,
            vec![Request {
                cmd_type: CmdType::Put as i32,
                put: Some(PutRequest {
                    key: key.to_vec(),
                    value: value.to_vec(),
                }),
                ..Default::default()
            }],
            TEST_WAIT_TIMEOUT,
        );
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let resp = self.request(
            key,
            vec![Request {
                cmd_type: CmdType::Get as i32,
                get: Some(GetRequest { key: key.to_vec() }),
                ..Default::default()
            }],
            TEST_WAIT_TIMEOUT,
        );
        let get = resp.responses[0].get.as_ref().unwrap();
        if get.found {
            Some(get.value.clone())
        } else {
            None
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        self.stop();
    }
}
