use raft::eraftpb::ConfState;

use crate::cmdpb::{AdminCmdType, CmdRequest};
use crate::errors::{Error, Result};
use crate::metapb::{Peer, PeerRole, Shard, ShardEpoch};

/// The initial shard epoch version / conf version.
pub const INIT_EPOCH_VER: u64 = 1;
pub const INIT_EPOCH_CONF_VER: u64 = 1;

pub fn find_peer(shard: &Shard, store_id: u64) -> Option<&Peer> {
    shard.peers.iter().find(|p| p.store_id == store_id)
}

pub fn find_peer_by_id(shard: &Shard, peer_id: u64) -> Option<&Peer> {
    shard.peers.iter().find(|p| p.id == peer_id)
}

pub fn remove_peer(shard: &mut Shard, store_id: u64) -> Option<Peer> {
    shard
        .peers
        .iter()
        .position(|p| p.store_id == store_id)
        .map(|i| shard.peers.remove(i))
}

/// A shard is initialized once it carries a peer set; a replica created
/// on demand by a raft message has none until a snapshot arrives.
pub fn is_shard_initialized(shard: &Shard) -> bool {
    !shard.peers.is_empty()
}

pub fn conf_state_from_shard(shard: &Shard) -> ConfState {
    let mut conf_state = ConfState::default();
    for peer in &shard.peers {
        if peer.role == PeerRole::Learner as i32 {
            conf_state.mut_learners().push(peer.id);
        } else {
            conf_state.mut_voters().push(peer.id);
        }
    }
    conf_state
}

/// Checks that `key` lies inside the shard's range. Empty `end_key` is
/// unbounded.
pub fn check_key_in_shard(key: &[u8], shard: &Shard) -> Result<()> {
    if key >= shard.start_key.as_slice() && (shard.end_key.is_empty() || key < shard.end_key.as_slice())
    {
        Ok(())
    } else {
        Err(Error::KeyOutOfRange(key.to_vec(), shard.clone()))
    }
}

/// Which epoch halves an admin command checks before it executes and
/// which it advances when it does.
#[derive(Clone, Copy, Debug)]
pub struct AdminCmdEpochState {
    pub check_ver: bool,
    pub check_conf_ver: bool,
    pub change_ver: bool,
    pub change_conf_ver: bool,
}

pub fn admin_cmd_epoch_state(cmd_type: AdminCmdType) -> AdminCmdEpochState {
    match cmd_type {
        AdminCmdType::ChangePeer => AdminCmdEpochState {
            check_ver: true,
            check_conf_ver: true,
            change_ver: false,
            change_conf_ver: true,
        },
        AdminCmdType::Split | AdminCmdType::Merge => AdminCmdEpochState {
            check_ver: true,
            check_conf_ver: true,
            change_ver: true,
            change_conf_ver: false,
        },
        // Compaction carries no epoch semantics.
        AdminCmdType::CompactLog | AdminCmdType::InvalidAdmin => AdminCmdEpochState {
            check_ver: false,
            check_conf_ver: false,
            change_ver: false,
            change_conf_ver: false,
        },
    }
}

/// Validates the epoch a request observed at propose time against the
/// shard's current epoch. Admin commands check both halves; normal data
/// commands respect `version` only, for range-routing correctness.
pub fn check_shard_epoch(req: &CmdRequest, shard: &Shard) -> Result<()> {
    let (check_ver, check_conf_ver) = if req.has_admin_request() {
        let state = admin_cmd_epoch_state(req.admin_request().cmd_type());
        (state.check_ver, state.check_conf_ver)
    } else {
        (true, false)
    };

    if !check_ver && !check_conf_ver {
        return Ok(());
    }

    let from_epoch = match req.header.as_ref().and_then(|h| h.epoch) {
        Some(e) => e,
        None => {
            return Err(Error::StaleEpoch(
                format!("missing epoch, shard {}", shard.id),
                shard.epoch(),
            ));
        }
    };
    let current_epoch = shard.epoch();
    if (check_ver && from_epoch.version != current_epoch.version)
        || (check_conf_ver && from_epoch.conf_version != current_epoch.conf_version)
    {
        return Err(Error::StaleEpoch(
            format!(
                "current epoch of shard {} is {:?}, but you sent {:?}",
                shard.id, current_epoch, from_epoch
            ),
            current_epoch,
        ));
    }
    Ok(())
}

/// True if `epoch` is strictly older than `current` in either half.
pub fn is_epoch_stale(epoch: ShardEpoch, current: ShardEpoch) -> bool {
    epoch.version < current.version || epoch.conf_version < current.conf_version
}

#[cfg(test)]
mod tests {
    use crate::cmdpb::{AdminRequest, RequestHeader};

    use super::*;

    fn shard_with_epoch(ver: u64, conf_ver: u64) -> Shard {
        Shard {
            id: 1,
            epoch: Some(ShardEpoch {
                version: ver,
                conf_version: conf_ver,
            }),
            peers: vec![crate::metapb::new_peer(2, 1)],
            ..Default::default()
        }
    }

    fn req_with_epoch(ver: u64, conf_ver: u64, admin: Option<AdminCmdType>) -> CmdRequest {
        let mut req = CmdRequest {
            header: Some(RequestHeader {
                shard_id: 1,
                epoch: Some(ShardEpoch {
                    version: ver,
                    conf_version: conf_ver,
                }),
                ..Default::default()
            }),
            ..Default::default()
        };
        if let Some(cmd_type) = admin {
            req.admin_request = Some(AdminRequest {
                cmd_type: cmd_type as i32,
                ..Default::default()
            });
        }
        req
    }

    #[test]
    fn test_normal_cmd_ignores_conf_version() {
        let shard = shard_with_epoch(2, 5);
        check_shard_epoch(&req_with_epoch(2, 1, None), &shard).unwrap();
        assert!(check_shard_epoch(&req_with_epoch(1, 5, None), &shard).is_err());
    }

    #[test]
    fn test_admin_cmd_checks_both() {
        let shard = shard_with_epoch(2, 5);
        check_shard_epoch(&req_with_epoch(2, 5, Some(AdminCmdType::Split)), &shard).unwrap();
        assert!(
            check_shard_epoch(&req_with_epoch(2, 4, Some(AdminCmdType::Split)), &shard).is_err()
        );
        assert!(
            check_shard_epoch(&req_with_epoch(1, 5, Some(AdminCmdType::ChangePeer)), &shard)
                .is_err()
        );
        // Log compaction never carries epoch semantics.
        check_shard_epoch(&req_with_epoch(0, 0, Some(AdminCmdType::CompactLog)), &shard).unwrap();
    }

    #[test]
    fn test_check_key_in_shard() {
        let mut shard = shard_with_epoch(1, 1);
        shard.start_key = b"b".to_vec();
        shard.end_key = b"d".to_vec();
        check_key_in_shard(b"b", &shard).unwrap();
        check_key_in_shard(b"c", &shard).unwrap();
        assert!(check_key_in_shard(b"a", &shard).is_err());
        assert!(check_key_in_shard(b"d", &shard).is_err());

        shard.end_key = vec![];
        check_key_in_shard(b"zzz", &shard).unwrap();
    }
}
