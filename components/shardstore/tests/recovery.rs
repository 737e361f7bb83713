//! Crash-recovery behavior: the log is the source of truth and committed
//! entries are re-applied over whatever the data store holds.

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use engine_traits::Peekable;
use shardstore::keys;
use shardstore::raftpb::ApplyState;

use common::{TestCluster, TEST_WAIT_TIMEOUT};

#[test]
fn test_reapply_after_applied_index_rewrite() {
    let rewound_index = Arc::new(AtomicU64::new(0));
    let mut cluster = TestCluster::prepare(1);
    let slot = rewound_index.clone();
    cluster.set_adjust(Box::new(move |_, cfg| {
        let slot = slot.clone();
        cfg.customize.adjust_init_applied_index_factory = Some(Arc::new(move |_group| {
            let slot = slot.clone();
            Arc::new(move |_shard, applied| {
                let adjusted = slot.load(Ordering::SeqCst);
                if adjusted == 0 {
                    applied
                } else {
                    adjusted
                }
            })
        }));
    }));
    cluster.start_all();
    cluster.wait_leaders_by_count(1, TEST_WAIT_TIMEOUT);

    cluster.put(b"k1", b"v1");
    assert_eq!(cluster.get(b"k1"), Some(b"v1".to_vec()));

    let shard_id = cluster.sorted_shards(0, 0)[0].id;
    let engines = cluster.engines(0).clone();
    let state: ApplyState = engines
        .meta
        .get_msg(&keys::apply_state_key(shard_id))
        .unwrap()
        .unwrap();

    // Corrupt the data store behind the state machine's back, then
    // rewind the applied index by one entry.
    engines.data.put_value(&keys::data_key(0, b"k1"), b"v2");
    rewound_index.store(state.applied_index - 1, Ordering::SeqCst);

    cluster.restart();
    cluster.wait_leaders_by_count(1, TEST_WAIT_TIMEOUT);

    // The replica re-applies the tail of the log and corrects the
    // divergence.
    assert_eq!(cluster.get(b"k1"), Some(b"v1".to_vec()));
    cluster.stop();
}

#[test]
fn test_restart_preserves_apply_state_invariant() {
    let mut cluster = TestCluster::new(1);
    cluster.wait_leaders_by_count(1, TEST_WAIT_TIMEOUT);
    for i in 0..10u32 {
        cluster.put(format!("key{}", i).as_bytes(), b"v");
    }

    cluster.restart();
    cluster.wait_leaders_by_count(1, TEST_WAIT_TIMEOUT);

    let shard_id = cluster.sorted_shards(0, 0)[0].id;
    let state: ApplyState = cluster
        .engines(0)
        .meta
        .get_msg(&keys::apply_state_key(shard_id))
        .unwrap()
        .unwrap();
    assert!(state.applied_index >= state.truncated().index);
    for i in 0..10u32 {
        assert_eq!(
            cluster.get(format!("key{}", i).as_bytes()),
            Some(b"v".to_vec())
        );
    }
    cluster.stop();
}
