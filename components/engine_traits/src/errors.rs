use std::io;
use std::result;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Codec {0}")]
    Codec(#[from] prost::DecodeError),
    #[error("Io {0}")]
    Io(#[from] io::Error),
    #[error("Engine {0}")]
    Engine(String),
    #[error("key {} is not in range [{}, {})",
        hex::encode_upper(.key),
        hex::encode_upper(.start),
        hex::encode_upper(.end))]
    NotInRange {
        key: Vec<u8>,
        start: Vec<u8>,
        end: Vec<u8>,
    },
}

pub type Result<T> = result::Result<T, Error>;
