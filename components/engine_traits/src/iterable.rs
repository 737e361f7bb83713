use crate::errors::Result;

/// Forward range iteration with short-circuit.
pub trait Iterable {
    /// Visits every pair in `[start, end)` in key order. An empty `end`
    /// means unbounded. The visitor returns `false` to stop early.
    fn scan<F>(&self, start: &[u8], end: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>;

    /// Returns the first pair with key `>= key`, if any.
    fn seek(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}
