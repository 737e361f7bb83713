pub mod apply;
pub mod bootstrap;
pub mod cmd_resp;
pub mod fsm;
pub mod msg;
pub mod peer;
pub mod router;
pub mod shard_state;
pub mod snap;
pub mod transport;
pub mod util;
pub mod worker;

pub use self::fsm::{create_router, ShardStore, StoreContext, StoreMeta};
pub use self::msg::{Callback, PeerMsg, RaftCommand, ShardMessage, StoreMsg};
pub use self::router::Router;
pub use self::snap::{SnapEntry, SnapKey, SnapManager};
pub use self::transport::{InProcessTransport, Transport};
