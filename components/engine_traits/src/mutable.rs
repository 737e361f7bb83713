use crate::errors::Result;

/// Types to which single key-value mutations can be applied.
///
/// Implemented by both engines and write batches; on an engine the
/// mutation takes effect immediately, on a batch it is buffered until the
/// batch is written.
pub trait Mutable {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    fn delete(&mut self, key: &[u8]) -> Result<()>;

    /// Deletes all keys in `[start, end)`.
    fn delete_range(&mut self, start: &[u8], end: &[u8]) -> Result<()>;

    /// Writes a message-valued key, encoding it with prost.
    fn put_msg<M: prost::Message>(&mut self, key: &[u8], m: &M) -> Result<()> {
        self.put(key, &m.encode_to_vec())
    }
}
