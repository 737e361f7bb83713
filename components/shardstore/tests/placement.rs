//! Placement-driver driven shard creation: async add, placement rules,
//! resource pools.

mod common;

use std::sync::Arc;

use shardstore::metapb::Shard;
use shardstore::pd::{LabelConstraint, PlacementDriver, PlacementRule, PoolSpec};

use common::{TestCluster, TEST_WAIT_TIMEOUT};

fn initial_a_b() -> Box<dyn Fn(usize, &mut shardstore::config::Config)> {
    Box::new(|_, cfg| {
        cfg.customize.initial_shards_factory = Some(Arc::new(|| {
            vec![Shard {
                start_key: b"a".to_vec(),
                end_key: b"b".to_vec(),
                ..Default::default()
            }]
        }));
    })
}

#[test]
fn test_async_add_shard() {
    let mut cluster = TestCluster::with_adjust(1, initial_a_b());
    cluster.wait_shard_count_per_node(1, TEST_WAIT_TIMEOUT);

    cluster
        .pd
        .async_add_shards(vec![Shard {
            start_key: b"b".to_vec(),
            end_key: b"c".to_vec(),
            unique: "abc".to_owned(),
            ..Default::default()
        }])
        .unwrap();

    cluster.wait_shard_count_per_node(2, TEST_WAIT_TIMEOUT);
    let shards = cluster.sorted_shards(0, 0);
    let added = shards
        .iter()
        .find(|s| s.start_key == b"b".to_vec())
        .expect("added shard");
    assert_eq!(added.end_key, b"c".to_vec());
    cluster.wait_shard_running(added.id, TEST_WAIT_TIMEOUT);

    // The same unique token is refused.
    assert!(cluster
        .pd
        .async_add_shards(vec![Shard {
            start_key: b"b".to_vec(),
            end_key: b"c".to_vec(),
            unique: "abc".to_owned(),
            ..Default::default()
        }])
        .is_err());
    cluster.stop();
}

#[test]
fn test_placement_rule_with_least_peers() {
    let mut cluster = TestCluster::with_adjust(3, initial_a_b());
    // The initial shard replicates to all three nodes first.
    cluster.wait_shard_count_per_node(1, TEST_WAIT_TIMEOUT);

    cluster
        .pd
        .put_placement_rule(PlacementRule {
            group_id: "g1".to_owned(),
            id: "id1".to_owned(),
            count: 3,
            label_constraints: vec![LabelConstraint {
                key: "c".to_owned(),
                values: vec!["0".to_owned(), "1".to_owned()],
            }],
        })
        .unwrap();
    cluster
        .pd
        .async_add_shards_with_least_peers(
            vec![Shard {
                start_key: b"b".to_vec(),
                end_key: b"c".to_vec(),
                unique: "abc".to_owned(),
                rule_groups: vec!["g1".to_owned()],
                ..Default::default()
            }],
            vec![2],
        )
        .unwrap();

    // Only the two stores matching the constraint host the new shard.
    cluster.wait_shard_counts(&[2, 2, 1], TEST_WAIT_TIMEOUT);
    cluster.stop();
}

#[test]
fn test_resource_pool_alloc_and_write() {
    let mut cluster = TestCluster::with_adjust(1, initial_a_b());
    cluster.wait_shard_count_per_node(1, TEST_WAIT_TIMEOUT);

    cluster
        .pd
        .create_resource_pool(PoolSpec {
            group: 0,
            capacity: 4,
            range_prefix: b"b".to_vec(),
        })
        .unwrap();

    cluster.wait_shard_count_per_node(5, TEST_WAIT_TIMEOUT);
    cluster.wait_leaders_by_count(5, TEST_WAIT_TIMEOUT);

    for i in 0..4u64 {
        let shard = cluster
            .pd
            .pool_alloc(0, 0, format!("{}", i).as_bytes())
            .unwrap()
            .expect("pool shard");
        cluster.put(&shard.start_key, b"OK");
        assert_eq!(cluster.get(&shard.start_key), Some(b"OK".to_vec()));
    }
    // Capacity exhausted.
    assert!(cluster.pd.pool_alloc(0, 0, b"one-too-many").is_err());
    cluster.stop();
}
