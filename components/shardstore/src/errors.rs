use std::error;
use std::io;
use std::result;

use thiserror::Error;

use crate::cmdpb;
use crate::metapb::{Peer, Shard, ShardEpoch};

/// Describes why a message is discarded by the transport.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum DiscardReason {
    Disconnected,
    Full,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("shard {0} not found")]
    ShardNotFound(u64),
    #[error("shard {0} not initialized yet")]
    ShardNotInitialized(u64),
    #[error("peer is not leader for shard {0}, leader may {1:?}")]
    NotLeader(u64, Option<Peer>),
    #[error("stale epoch {0}, current {1:?}")]
    StaleEpoch(String, ShardEpoch),
    #[error("stale command")]
    StaleCommand,
    #[error(
        "key {} is not in shard key range [{}, {}) for shard {}",
        hex::encode_upper(.0),
        hex::encode_upper(&.1.start_key),
        hex::encode_upper(&.1.end_key),
        .1.id
    )]
    KeyOutOfRange(Vec<u8>, Shard),
    #[error("timeout {0}")]
    Timeout(String),
    #[error("to store id {0}, mine {1}")]
    StoreNotMatch(u64, u64),
    #[error("raft entry is too large, shard {0}, entry size {1}")]
    RaftEntryTooLarge(u64, u64),
    #[error("discard due to {0:?}")]
    Transport(DiscardReason),

    #[error("Io {0}")]
    Io(#[from] io::Error),
    #[error("Engine {0}")]
    Engine(#[from] engine_traits::Error),
    #[error("Raft {0}")]
    Raft(#[from] raft::Error),
    #[error("Protobuf {0}")]
    Protobuf(#[from] protobuf::ProtobufError),
    #[error("Decode {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("{0:?}")]
    Other(#[from] Box<dyn error::Error + Sync + Send>),
}

pub type Result<T> = result::Result<T, Error>;

#[macro_export]
macro_rules! box_err {
    ($e:expr) => ({
        let e: Box<dyn std::error::Error + Sync + Send> = format!("[{}:{}]: {}", file!(), line!(), $e).into();
        e.into()
    });
    ($f:tt, $($arg:expr),+) => ({
        $crate::box_err!(format!($f, $($arg),+))
    });
}

#[macro_export]
macro_rules! box_try {
    ($expr:expr) => {
        match $expr {
            Ok(r) => r,
            Err(e) => return Err($crate::box_err!(e)),
        }
    };
}

impl From<Error> for cmdpb::CmdError {
    fn from(err: Error) -> cmdpb::CmdError {
        let mut e = cmdpb::CmdError {
            message: format!("{}", err),
            ..Default::default()
        };
        match err {
            Error::ShardNotFound(shard_id) => {
                e.shard_not_found = Some(cmdpb::ShardNotFound { shard_id });
            }
            Error::NotLeader(shard_id, leader) => {
                e.not_leader = Some(cmdpb::NotLeader { shard_id, leader });
            }
            Error::StaleEpoch(_, current) => {
                e.stale_epoch = Some(cmdpb::StaleEpoch {
                    current_epoch: Some(current),
                });
            }
            Error::StaleCommand => {
                e.stale_command = true;
            }
            Error::KeyOutOfRange(key, shard) => {
                e.key_out_of_range = Some(cmdpb::KeyOutOfRange {
                    key,
                    shard_id: shard.id,
                    start_key: shard.start_key,
                    end_key: shard.end_key,
                });
            }
            Error::Timeout(_) => {
                e.timeout = true;
            }
            _ => {}
        }
        e
    }
}

impl From<Error> for raft::Error {
    fn from(err: Error) -> raft::Error {
        raft::Error::Store(raft::StorageError::Other(err.into()))
    }
}

impl<T> From<crossbeam::channel::TrySendError<T>> for Error {
    #[inline]
    fn from(e: crossbeam::channel::TrySendError<T>) -> Error {
        match e {
            crossbeam::channel::TrySendError::Full(_) => Error::Transport(DiscardReason::Full),
            crossbeam::channel::TrySendError::Disconnected(_) => {
                Error::Transport(DiscardReason::Disconnected)
            }
        }
    }
}

impl<T> From<crossbeam::channel::SendError<T>> for Error {
    #[inline]
    fn from(_: crossbeam::channel::SendError<T>) -> Error {
        Error::Transport(DiscardReason::Disconnected)
    }
}
