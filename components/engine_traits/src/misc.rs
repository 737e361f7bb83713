use crate::errors::Result;

/// Miscellaneous whole-engine operations.
pub trait MiscExt {
    /// Flushes buffered writes to durable storage.
    fn flush(&self, sync: bool) -> Result<()>;

    /// Immediately deletes all keys in `[start, end)`, outside of any
    /// batch. Used when reclaiming a destroyed shard's range.
    fn delete_all_in_range(&self, start: &[u8], end: &[u8]) -> Result<()>;
}

/// Size statistics over a key range, driving the split checker.
pub trait RangeStatsExt {
    /// Approximate total size in bytes of keys and values in
    /// `[start, end)`.
    fn approximate_size_in_range(&self, start: &[u8], end: &[u8]) -> Result<u64>;

    /// Scans `[start, end)` and suggests split keys once the range
    /// outgrows `capacity` bytes. Returns the observed size and the
    /// suggested keys; an empty suggestion means the range is still small
    /// enough. Split keys are strictly inside the range, never its
    /// boundaries.
    fn split_check(&self, start: &[u8], end: &[u8], capacity: u64) -> Result<(u64, Vec<Vec<u8>>)>;
}
