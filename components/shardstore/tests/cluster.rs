//! Cluster bootstrap, replication and restart behavior.

mod common;

use std::sync::Arc;

use shardstore::metapb::Shard;

use common::{TestCluster, TEST_WAIT_TIMEOUT};

#[test]
fn test_cluster_start_and_stop() {
    let mut cluster = TestCluster::new(3);
    // One raft group, replicated onto every node by the placement
    // driver, with a single leader.
    cluster.wait_shard_count_per_node(1, TEST_WAIT_TIMEOUT);
    cluster.wait_leaders_by_count(1, TEST_WAIT_TIMEOUT);
    cluster.stop();
}

#[test]
fn test_single_node_put_get() {
    let mut cluster = TestCluster::new(1);
    cluster.wait_leaders_by_count(1, TEST_WAIT_TIMEOUT);

    cluster.put(b"hello", b"world");
    assert_eq!(cluster.get(b"hello"), Some(b"world".to_vec()));
    assert_eq!(cluster.get(b"absent"), None);
    cluster.stop();
}

#[test]
fn test_replicated_write_survives_on_all_nodes() {
    let mut cluster = TestCluster::new(3);
    cluster.wait_shard_count_per_node(1, TEST_WAIT_TIMEOUT);

    cluster.put(b"k", b"v");
    assert_eq!(cluster.get(b"k"), Some(b"v".to_vec()));
    cluster.stop();
}

#[test]
fn test_initial_member_marks_bootstrap_peer_only() {
    let mut cluster = TestCluster::with_adjust(
        3,
        Box::new(|_, cfg| {
            cfg.customize.initial_shards_factory = Some(Arc::new(|| {
                vec![Shard {
                    start_key: b"a".to_vec(),
                    end_key: b"b".to_vec(),
                    ..Default::default()
                }]
            }));
        }),
    );
    cluster.wait_shard_count_per_node(1, TEST_WAIT_TIMEOUT);

    let shards = cluster.sorted_shards(0, 0);
    assert_eq!(shards.len(), 1);
    assert_eq!(shards[0].start_key, b"a".to_vec());
    assert_eq!(shards[0].end_key, b"b".to_vec());
    // Replicas added by the scheduler are not initial members; only the
    // bootstrap replica is.
    let initial_members = shards[0].peers.iter().filter(|p| p.initial_member).count();
    assert_eq!(initial_members, 1);
    assert_eq!(shards[0].peers.len(), 3);
    cluster.stop();
}

#[test]
fn test_restart_recovers_shards() {
    let mut cluster = TestCluster::new(1);
    cluster.wait_leaders_by_count(1, TEST_WAIT_TIMEOUT);
    cluster.put(b"persist", b"me");

    cluster.restart();
    cluster.wait_leaders_by_count(1, TEST_WAIT_TIMEOUT);
    assert_eq!(cluster.get(b"persist"), Some(b"me".to_vec()));
    cluster.stop();
}
