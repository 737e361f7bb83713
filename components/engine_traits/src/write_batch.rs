use crate::errors::Result;
use crate::mutable::Mutable;

#[derive(Clone, Copy, Debug, Default)]
pub struct WriteOptions {
    /// Force a durable flush before the write returns.
    pub sync: bool,
}

pub trait WriteBatchExt: Sized {
    type WriteBatch: WriteBatch;

    fn write_batch(&self) -> Self::WriteBatch;
    fn write_batch_with_cap(&self, cap: usize) -> Self::WriteBatch;

    /// Applies all mutations in the batch atomically.
    fn write_opt(&self, wb: &Self::WriteBatch, opts: &WriteOptions) -> Result<()>;
    fn write(&self, wb: &Self::WriteBatch) -> Result<()> {
        self.write_opt(wb, &WriteOptions::default())
    }
}

pub trait WriteBatch: Mutable + Send {
    fn data_size(&self) -> usize;
    fn count(&self) -> usize;
    fn is_empty(&self) -> bool;
    fn clear(&mut self);

    /// Save points let a caller undo the mutations buffered since the last
    /// mark, which the apply path uses to roll back a failed command.
    fn set_save_point(&mut self);
    fn pop_save_point(&mut self) -> Result<()>;
    fn rollback_to_save_point(&mut self) -> Result<()>;
}
