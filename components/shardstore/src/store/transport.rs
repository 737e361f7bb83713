use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use prost::Message;

use crate::errors::{DiscardReason, Error, Result};
use crate::raftpb::SnapshotHeader;
use crate::store::msg::{ShardMessage, StoreMsg};
use crate::store::router::Router;
use crate::store::snap::{transfer_snapshot, SnapKey, SnapManager};

/// Transports messages between stores. Snapshot-bearing messages imply
/// moving the referenced artifact as well; how is up to the
/// implementation (the in-process one hands it between snap managers).
pub trait Transport: Send + Sync {
    fn send(&self, msg: ShardMessage) -> Result<()>;
}

/// Transport between stores living in one process: routes messages over
/// channels and moves snapshot artifacts between the stores' snap
/// managers.
#[derive(Clone, Default)]
pub struct InProcessTransport {
    core: Arc<Mutex<HashMap<u64, (Router, SnapManager)>>>,
}

impl InProcessTransport {
    pub fn register_store(&self, store_id: u64, router: Router, snap_mgr: SnapManager) {
        self.core
            .lock()
            .unwrap()
            .insert(store_id, (router, snap_mgr));
    }

    pub fn unregister_store(&self, store_id: u64) {
        self.core.lock().unwrap().remove(&store_id);
    }
}

impl Transport for InProcessTransport {
    fn send(&self, msg: ShardMessage) -> Result<()> {
        let (router, to_mgr) = {
            let core = self.core.lock().unwrap();
            match core.get(&msg.to_peer.store_id) {
                Some(entry) => entry.clone(),
                None => return Err(Error::Transport(DiscardReason::Disconnected)),
            }
        };

        if msg.message.has_snapshot() {
            let snap = msg.message.get_snapshot();
            let header = SnapshotHeader::decode(snap.get_data())?;
            let key = SnapKey::from_header(&header);
            if !to_mgr.exists(&key) {
                let from_mgr = {
                    let core = self.core.lock().unwrap();
                    core.get(&msg.from_peer.store_id).map(|(_, m)| m.clone())
                };
                if let Some(from_mgr) = from_mgr {
                    transfer_snapshot(&from_mgr, &to_mgr, key)?;
                }
            }
        }

        router.send_store(StoreMsg::RaftMessage(msg))
    }
}
