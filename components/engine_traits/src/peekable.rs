use crate::errors::Result;

/// Types from which values can be read by key.
pub trait Peekable {
    /// Reads the value for the given key, or `None` if it is absent.
    fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Reads a message-valued key, decoding it with prost.
    fn get_msg<M: prost::Message + Default>(&self, key: &[u8]) -> Result<Option<M>> {
        let value = match self.get_value(key)? {
            Some(v) => v,
            None => return Ok(None),
        };
        let m = M::decode(value.as_slice())?;
        Ok(Some(m))
    }
}
