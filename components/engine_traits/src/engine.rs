use std::fmt::Debug;

use crate::*;

/// A consistent read-only view of an engine.
pub trait Snapshot: Peekable + Iterable + Send + Sync + Debug + 'static {}

/// An ordered key-value engine.
///
/// `Clone` is expected to be cheap: an engine value is a handle to shared
/// state, and every component holding one sees the same data.
pub trait KvEngine:
    Peekable + Iterable + WriteBatchExt + MiscExt + RangeStatsExt + Send + Sync + Clone + Debug + 'static
{
    type Snapshot: Snapshot;

    /// Takes a point-in-time snapshot of the engine.
    fn snapshot(&self) -> Self::Snapshot;
}
