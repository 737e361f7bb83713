//! An in-memory implementation of `engine_traits` backed by an ordered
//! map. It is the default engine for tests and embedded single-process
//! deployments; everything the shard store needs from a real engine —
//! atomic write batches, range deletes, visitor scans, split-check
//! statistics — behaves the same here, minus durability.

mod engine;
mod write_batch;

pub use crate::engine::{MemEngine, MemSnapshot};
pub use crate::write_batch::MemWriteBatch;
