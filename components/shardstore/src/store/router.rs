use crossbeam::channel::Sender;

use crate::errors::Result;
use crate::store::msg::{PeerMsg, StoreMsg};

/// Cheap handle for sending messages into the store event loop.
#[derive(Clone)]
pub struct Router {
    sender: Sender<StoreMsg>,
}

impl Router {
    pub fn new(sender: Sender<StoreMsg>) -> Router {
        Router { sender }
    }

    pub fn send_store(&self, msg: StoreMsg) -> Result<()> {
        self.sender.send(msg)?;
        Ok(())
    }

    pub fn send_peer(&self, shard_id: u64, msg: PeerMsg) -> Result<()> {
        self.send_store(StoreMsg::Peer { shard_id, msg })
    }
}
