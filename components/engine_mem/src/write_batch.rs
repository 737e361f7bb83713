use engine_traits::{Error, Mutable, Result, WriteBatch};

#[derive(Clone, Debug)]
pub(crate) enum Op {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
    DeleteRange { start: Vec<u8>, end: Vec<u8> },
}

impl Op {
    fn size(&self) -> usize {
        match self {
            Op::Put { key, value } => key.len() + value.len(),
            Op::Delete { key } => key.len(),
            Op::DeleteRange { start, end } => start.len() + end.len(),
        }
    }
}

/// Buffered mutations, applied in order on write.
#[derive(Default)]
pub struct MemWriteBatch {
    ops: Vec<Op>,
    save_points: Vec<usize>,
}

impl MemWriteBatch {
    pub(crate) fn with_capacity(cap: usize) -> MemWriteBatch {
        MemWriteBatch {
            ops: Vec::with_capacity(cap),
            save_points: Vec::new(),
        }
    }

    pub(crate) fn ops(&self) -> &[Op] {
        &self.ops
    }
}

impl Mutable for MemWriteBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.ops.push(Op::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<()> {
        self.ops.push(Op::Delete { key: key.to_vec() });
        Ok(())
    }

    fn delete_range(&mut self, start: &[u8], end: &[u8]) -> Result<()> {
        self.ops.push(Op::DeleteRange {
            start: start.to_vec(),
            end: end.to_vec(),
        });
        Ok(())
    }
}

impl WriteBatch for MemWriteBatch {
    fn data_size(&self) -> usize {
        self.ops.iter().map(Op::size).sum()
    }

    fn count(&self) -> usize {
        self.ops.len()
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn clear(&mut self) {
        self.ops.clear();
        self.save_points.clear();
    }

    fn set_save_point(&mut self) {
        self.save_points.push(self.ops.len());
    }

    fn pop_save_point(&mut self) -> Result<()> {
        self.save_points
            .pop()
            .map(|_| ())
            .ok_or_else(|| Error::Engine("no save point".to_owned()))
    }

    fn rollback_to_save_point(&mut self) -> Result<()> {
        match self.save_points.pop() {
            Some(mark) => {
                self.ops.truncate(mark);
                Ok(())
            }
            None => Err(Error::Engine("no save point".to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_point_rollback() {
        let mut wb = MemWriteBatch::default();
        wb.put(b"a", b"1").unwrap();
        wb.set_save_point();
        wb.put(b"b", b"2").unwrap();
        wb.delete(b"a").unwrap();
        wb.rollback_to_save_point().unwrap();
        assert_eq!(wb.count(), 1);

        wb.set_save_point();
        wb.put(b"c", b"3").unwrap();
        wb.pop_save_point().unwrap();
        assert_eq!(wb.count(), 2);
        assert!(wb.rollback_to_save_point().is_err());
    }
}
