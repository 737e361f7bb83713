//! Admin merge: the target absorbs the sibling's range; the sibling is
//! tombstoned once its applied index crossed the merge barrier, and its
//! data survives under the target.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use engine_traits::Peekable;
use shardstore::cmdpb::{AdminCmdType, AdminRequest, CmdRequest, MergeRequest, RequestHeader};
use shardstore::keys;
use shardstore::metapb::Shard;
use shardstore::raftpb::{ApplyState, PeerState, ShardLocalState};

use common::{TestCluster, TEST_WAIT_TIMEOUT};

#[test]
fn test_admin_merge_absorbs_sibling() {
    let mut cluster = TestCluster::with_adjust(
        1,
        Box::new(|_, cfg| {
            cfg.customize.initial_shards_factory = Some(Arc::new(|| {
                vec![
                    Shard {
                        end_key: b"m".to_vec(),
                        ..Default::default()
                    },
                    Shard {
                        start_key: b"m".to_vec(),
                        ..Default::default()
                    },
                ]
            }));
        }),
    );
    cluster.wait_shard_count_per_node(2, TEST_WAIT_TIMEOUT);
    cluster.wait_leaders_by_count(2, TEST_WAIT_TIMEOUT);

    cluster.put(b"a", b"left");
    cluster.put(b"z", b"right");

    let shards = cluster.sorted_shards(0, 0);
    let target = shards[0].clone();
    let source = shards[1].clone();
    assert_eq!(target.end_key, source.start_key);

    let engines = cluster.engines(0).clone();
    let source_state: ApplyState = engines
        .meta
        .get_msg(&keys::apply_state_key(source.id))
        .unwrap()
        .unwrap();

    let req = CmdRequest {
        header: Some(RequestHeader {
            shard_id: target.id,
            epoch: Some(target.epoch()),
            ..Default::default()
        }),
        admin_request: Some(AdminRequest {
            cmd_type: AdminCmdType::Merge as i32,
            merge: Some(MergeRequest {
                source: Some(source.clone()),
                commit: source_state.applied_index,
            }),
            ..Default::default()
        }),
        ..Default::default()
    };
    let resp = cluster
        .node(0)
        .store
        .exec_command(target.id, req, Duration::from_secs(5))
        .unwrap();
    assert!(!resp.has_error(), "{:?}", resp.error());

    // The sibling is destroyed and the target owns the whole range.
    let deadline = Instant::now() + TEST_WAIT_TIMEOUT;
    loop {
        let shards = cluster.sorted_shards(0, 0);
        if shards.len() == 1 && shards[0].end_key.is_empty() && shards[0].start_key.is_empty() {
            assert_eq!(shards[0].id, target.id);
            assert!(shards[0].epoch().version > target.epoch().version);
            break;
        }
        assert!(Instant::now() < deadline, "merge did not settle: {:?}", shards);
        std::thread::sleep(Duration::from_millis(20));
    }

    // The sibling's tombstone is durable and its data survived under
    // the target.
    let deadline = Instant::now() + TEST_WAIT_TIMEOUT;
    loop {
        let state: Option<ShardLocalState> = engines
            .meta
            .get_msg(&keys::local_state_key(source.id))
            .unwrap();
        if state.map_or(false, |s| s.state() == PeerState::Tombstone) {
            break;
        }
        assert!(Instant::now() < deadline, "source not tombstoned");
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(cluster.get(b"a"), Some(b"left".to_vec()));
    assert_eq!(cluster.get(b"z"), Some(b"right".to_vec()));
    cluster.stop();
}
