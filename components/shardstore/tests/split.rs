//! Size-triggered and custom split checks.

mod common;

use std::sync::Arc;

use engine_traits::Iterable;
use shardstore::config::SplitCheckFn;
use shardstore::keys;
use shardstore::metapb::Shard;
use shardstore::util::config::ReadableSize;

use common::{TestCluster, TEST_WAIT_TIMEOUT};

#[test]
fn test_size_triggered_split() {
    let mut cluster = TestCluster::with_adjust(
        1,
        Box::new(|_, cfg| {
            cfg.replication.shard_capacity_bytes = ReadableSize(20);
            cfg.replication.shard_split_check_bytes = ReadableSize(10);
        }),
    );
    cluster.wait_shard_count_per_node(1, TEST_WAIT_TIMEOUT);

    cluster.put(b"key1", b"value11");
    cluster.put(b"key2", b"value22");
    cluster.put(b"key3", b"value33");

    // The shard splits at its median until every half fits.
    cluster.wait_shard_count_per_node(3, TEST_WAIT_TIMEOUT);
    cluster.check_shard_range(0, 0, b"", b"key2");
    cluster.check_shard_range(0, 1, b"key2", b"key3");
    cluster.check_shard_range(0, 2, b"key3", b"");

    // Data stays reachable across the split boundaries.
    assert_eq!(cluster.get(b"key1"), Some(b"value11".to_vec()));
    assert_eq!(cluster.get(b"key2"), Some(b"value22".to_vec()));
    assert_eq!(cluster.get(b"key3"), Some(b"value33".to_vec()));
    cluster.stop();
}

#[test]
fn test_custom_split_at_explicit_key() {
    let mut cluster = TestCluster::prepare(1);
    let data_engine = cluster.engines(0).data.clone();
    cluster.set_adjust(Box::new(move |_, cfg| {
        cfg.replication.shard_capacity_bytes = ReadableSize(20);
        cfg.replication.shard_split_check_bytes = ReadableSize(10);
        let data_engine = data_engine.clone();
        cfg.customize.split_check_factory = Some(Arc::new(move |_group| {
            let data_engine = data_engine.clone();
            let check: SplitCheckFn = Arc::new(move |shard: &Shard| {
                let mut size = 0;
                let mut has_target = false;
                let target = keys::data_key(shard.group, b"key2");
                data_engine.scan(
                    &keys::enc_start_key(shard),
                    &keys::enc_end_key(shard),
                    |k, v| {
                        size += (k.len() + v.len()) as u64;
                        if k == target.as_slice() {
                            has_target = true;
                        }
                        Ok(true)
                    },
                )?;
                if shard.start_key.is_empty() && shard.end_key.is_empty() && has_target {
                    return Ok((size, vec![b"key2".to_vec()]));
                }
                Ok((size, vec![]))
            });
            check
        }));
    }));
    cluster.start_all();
    cluster.wait_shard_count_per_node(1, TEST_WAIT_TIMEOUT);

    cluster.put(b"key1", b"value11");
    cluster.put(b"key2", b"value22");
    cluster.put(b"key3", b"value33");

    cluster.wait_shard_count_per_node(2, TEST_WAIT_TIMEOUT);
    cluster.check_shard_range(0, 0, b"", b"key2");
    cluster.check_shard_range(0, 1, b"key2", b"");
    cluster.stop();
}

#[test]
fn test_split_bumps_version_and_partitions_range() {
    let mut cluster = TestCluster::with_adjust(
        1,
        Box::new(|_, cfg| {
            cfg.replication.shard_capacity_bytes = ReadableSize(20);
            cfg.replication.shard_split_check_bytes = ReadableSize(10);
        }),
    );
    cluster.wait_shard_count_per_node(1, TEST_WAIT_TIMEOUT);
    let before = cluster.sorted_shards(0, 0)[0].clone();

    cluster.put(b"key1", b"value11");
    cluster.put(b"key2", b"value22");
    cluster.put(b"key3", b"value33");
    cluster.wait_shard_count_per_node(3, TEST_WAIT_TIMEOUT);

    let shards = cluster.sorted_shards(0, 0);
    // The ranges partition the key space with no gaps or overlaps.
    assert!(shards[0].start_key.is_empty());
    assert!(shards.last().unwrap().end_key.is_empty());
    for pair in shards.windows(2) {
        assert_eq!(pair[0].end_key, pair[1].start_key);
    }
    // Every shard moved past the pre-split version.
    for shard in &shards {
        assert!(shard.epoch().version > before.epoch().version);
    }
    cluster.stop();
}
