use std::collections::BTreeMap;
use std::fmt::{self, Debug, Formatter};
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use engine_traits::{
    Iterable, KvEngine, MiscExt, Peekable, RangeStatsExt, Result, Snapshot, WriteBatchExt,
    WriteOptions,
};

use crate::write_batch::{MemWriteBatch, Op};

/// An ordered-map engine. Cloning yields another handle to the same data.
#[derive(Clone, Default)]
pub struct MemEngine {
    inner: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemEngine {
    pub fn new() -> MemEngine {
        MemEngine::default()
    }

    /// Writes a single key outside of any batch.
    pub fn put_value(&self, key: &[u8], value: &[u8]) {
        self.inner
            .write()
            .unwrap()
            .insert(key.to_vec(), value.to_vec());
    }

    /// Deletes a single key outside of any batch.
    pub fn delete_value(&self, key: &[u8]) {
        self.inner.write().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for MemEngine {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MemEngine [{} keys]", self.len())
    }
}

fn range_bounds(start: &[u8], end: &[u8]) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
    let low = Bound::Included(start.to_vec());
    let high = if end.is_empty() {
        Bound::Unbounded
    } else {
        Bound::Excluded(end.to_vec())
    };
    (low, high)
}

fn scan_map<F>(map: &BTreeMap<Vec<u8>, Vec<u8>>, start: &[u8], end: &[u8], mut f: F) -> Result<()>
where
    F: FnMut(&[u8], &[u8]) -> Result<bool>,
{
    for (k, v) in map.range(range_bounds(start, end)) {
        if !f(k, v)? {
            break;
        }
    }
    Ok(())
}

impl Peekable for MemEngine {
    fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.read().unwrap().get(key).cloned())
    }
}

impl Iterable for MemEngine {
    fn scan<F>(&self, start: &[u8], end: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        scan_map(&self.inner.read().unwrap(), start, end, f)
    }

    fn seek(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .range(key.to_vec()..)
            .next()
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}

impl WriteBatchExt for MemEngine {
    type WriteBatch = MemWriteBatch;

    fn write_batch(&self) -> MemWriteBatch {
        MemWriteBatch::default()
    }

    fn write_batch_with_cap(&self, cap: usize) -> MemWriteBatch {
        MemWriteBatch::with_capacity(cap)
    }

    fn write_opt(&self, wb: &MemWriteBatch, _opts: &WriteOptions) -> Result<()> {
        let mut map = self.inner.write().unwrap();
        for op in wb.ops() {
            match op {
                Op::Put { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                Op::Delete { key } => {
                    map.remove(key);
                }
                Op::DeleteRange { start, end } => {
                    let doomed: Vec<_> = map
                        .range(range_bounds(start, end))
                        .map(|(k, _)| k.clone())
                        .collect();
                    for k in doomed {
                        map.remove(&k);
                    }
                }
            }
        }
        Ok(())
    }
}

impl MiscExt for MemEngine {
    fn flush(&self, _sync: bool) -> Result<()> {
        Ok(())
    }

    fn delete_all_in_range(&self, start: &[u8], end: &[u8]) -> Result<()> {
        let mut map = self.inner.write().unwrap();
        let doomed: Vec<_> = map
            .range(range_bounds(start, end))
            .map(|(k, _)| k.clone())
            .collect();
        for k in doomed {
            map.remove(&k);
        }
        Ok(())
    }
}

impl RangeStatsExt for MemEngine {
    fn approximate_size_in_range(&self, start: &[u8], end: &[u8]) -> Result<u64> {
        let map = self.inner.read().unwrap();
        let mut size = 0;
        for (k, v) in map.range(range_bounds(start, end)) {
            size += (k.len() + v.len()) as u64;
        }
        Ok(size)
    }

    fn split_check(&self, start: &[u8], end: &[u8], capacity: u64) -> Result<(u64, Vec<Vec<u8>>)> {
        let map = self.inner.read().unwrap();
        let entries: Vec<(&Vec<u8>, u64)> = map
            .range(range_bounds(start, end))
            .map(|(k, v)| (k, (k.len() + v.len()) as u64))
            .collect();
        let total: u64 = entries.iter().map(|(_, s)| s).sum();
        if total < capacity {
            return Ok((total, vec![]));
        }
        // Split at the median key so both halves end up roughly equal.
        let mut acc = 0;
        for (key, size) in &entries {
            if acc * 2 >= total && key.as_slice() > start && (end.is_empty() || &key[..] < end) {
                return Ok((total, vec![key.to_vec()]));
            }
            acc += size;
        }
        Ok((total, vec![]))
    }
}

impl KvEngine for MemEngine {
    type Snapshot = MemSnapshot;

    fn snapshot(&self) -> MemSnapshot {
        MemSnapshot {
            map: self.inner.read().unwrap().clone(),
        }
    }
}

/// A frozen copy of the engine contents.
pub struct MemSnapshot {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl Debug for MemSnapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "MemSnapshot [{} keys]", self.map.len())
    }
}

impl Peekable for MemSnapshot {
    fn get_value(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.map.get(key).cloned())
    }
}

impl Iterable for MemSnapshot {
    fn scan<F>(&self, start: &[u8], end: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool>,
    {
        scan_map(&self.map, start, end, f)
    }

    fn seek(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        Ok(self
            .map
            .range(key.to_vec()..)
            .next()
            .map(|(k, v)| (k.clone(), v.clone())))
    }
}

impl Snapshot for MemSnapshot {}
