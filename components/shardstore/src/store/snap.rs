//! Snapshot lifecycle management.
//!
//! A snapshot artifact is a plain file addressed by
//! `(shard_id, term, index)` holding the shard's data-range contents. The
//! manager tracks which lifecycle stage a shard's snapshot is in and
//! enforces at most one registration of each stage per shard, which is
//! what keeps concurrent generate/send/receive/apply attempts (and
//! destruction) from racing each other.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use engine_traits::{Iterable, KvEngine, Mutable, WriteBatch, WriteBatchExt};
use slog::{info, Logger};

use crate::errors::Result;
use crate::raftpb::SnapshotHeader;
use crate::box_err;

/// Lifecycle stages a shard snapshot moves through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SnapEntry {
    Creating,
    Sending,
    Receiving,
    Applying,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SnapKey {
    pub shard_id: u64,
    pub term: u64,
    pub index: u64,
}

impl SnapKey {
    pub fn new(shard_id: u64, term: u64, index: u64) -> SnapKey {
        SnapKey {
            shard_id,
            term,
            index,
        }
    }

    pub fn from_header(header: &SnapshotHeader) -> SnapKey {
        SnapKey::new(header.shard().id, header.term, header.index)
    }
}

impl Display for SnapKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.shard_id, self.term, self.index)
    }
}

struct SnapManagerCore {
    // (shard_id, stage) -> snapshot being worked on.
    registry: HashMap<(u64, SnapEntry), SnapKey>,
}

/// Process-wide snapshot registry and artifact store.
#[derive(Clone)]
pub struct SnapManager {
    core: Arc<Mutex<SnapManagerCore>>,
    base: PathBuf,
    logger: Logger,
}

impl SnapManager {
    pub fn new<P: Into<PathBuf>>(path: P, logger: Logger) -> SnapManager {
        SnapManager {
            core: Arc::new(Mutex::new(SnapManagerCore {
                registry: HashMap::new(),
            })),
            base: path.into(),
            logger,
        }
    }

    pub fn init(&self) -> Result<()> {
        if !self.base.exists() {
            fs::create_dir_all(&self.base)?;
        }
        Ok(())
    }

    /// Registers `key` for the given stage. Returns false if another
    /// snapshot of the same stage is already in flight for the shard.
    pub fn register(&self, key: SnapKey, entry: SnapEntry) -> bool {
        let mut core = self.core.lock().unwrap();
        if core.registry.contains_key(&(key.shard_id, entry)) {
            return false;
        }
        core.registry.insert((key.shard_id, entry), key);
        true
    }

    pub fn deregister(&self, key: &SnapKey, entry: SnapEntry) {
        let mut core = self.core.lock().unwrap();
        if let Some(registered) = core.registry.get(&(key.shard_id, entry)) {
            if registered == key {
                core.registry.remove(&(key.shard_id, entry));
            }
        }
    }

    pub fn has_registered(&self, shard_id: u64, entry: SnapEntry) -> bool {
        self.core
            .lock()
            .unwrap()
            .registry
            .contains_key(&(shard_id, entry))
    }

    fn final_path(&self, key: &SnapKey) -> PathBuf {
        self.base.join(format!("{}.snap", key))
    }

    fn tmp_path(&self, key: &SnapKey) -> PathBuf {
        self.base.join(format!("{}.tmp", key))
    }

    fn recv_path(&self, key: &SnapKey) -> PathBuf {
        self.base.join(format!("{}.recv", key))
    }

    pub fn exists(&self, key: &SnapKey) -> bool {
        self.final_path(key).exists()
    }

    /// Builds the snapshot artifact from a consistent data view of the
    /// shard's encoded range. Idempotent on `key`: an existing artifact is
    /// reused.
    pub fn create(
        &self,
        key: &SnapKey,
        data: &impl Iterable,
        start: &[u8],
        end: &[u8],
    ) -> Result<u64> {
        if self.exists(key) {
            return Ok(fs::metadata(self.final_path(key))?.len());
        }
        let tmp = self.tmp_path(key);
        let count_and_size = {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            // Reserve the count header, fixed up after the scan.
            writer.write_u64::<BigEndian>(0)?;
            let mut count: u64 = 0;
            data.scan(start, end, |k, v| {
                writer.write_u32::<BigEndian>(k.len() as u32)?;
                writer.write_all(k)?;
                writer.write_u32::<BigEndian>(v.len() as u32)?;
                writer.write_all(v)?;
                count += 1;
                Ok(true)
            })?;
            writer.flush()?;
            let mut file = writer
                .into_inner()
                .map_err(|e| -> crate::errors::Error { box_err!(e.to_string()) })?;
            file.seek(SeekFrom::Start(0))?;
            file.write_u64::<BigEndian>(count)?;
            file.sync_all()?;
            (count, fs::metadata(&tmp)?.len())
        };
        fs::rename(&tmp, self.final_path(key))?;
        info!(
            self.logger,
            "snapshot artifact created";
            "snap_key" => %key,
            "kvs" => count_and_size.0,
            "size" => count_and_size.1,
        );
        Ok(count_and_size.1)
    }

    /// Reads the whole artifact payload for transfer.
    pub fn payload(&self, key: &SnapKey) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        File::open(self.final_path(key))?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Writes an incoming payload to a staging location, then promotes it
    /// to the final artifact.
    pub fn receive(&self, key: &SnapKey, mut stream: impl Read) -> Result<()> {
        if self.exists(key) {
            return Ok(());
        }
        let staging = self.recv_path(key);
        {
            let mut file = BufWriter::new(File::create(&staging)?);
            std::io::copy(&mut stream, &mut file)?;
            file.flush()?;
        }
        fs::rename(&staging, self.final_path(key))?;
        Ok(())
    }

    /// Streams the artifact's pairs into the data engine in bounded write
    /// batches. `check_abort` is polled between batches; returning true
    /// aborts the ingest.
    pub fn apply<E: KvEngine>(
        &self,
        key: &SnapKey,
        engine: &E,
        mut check_abort: impl FnMut() -> bool,
    ) -> Result<bool> {
        const BATCH_KEYS: usize = 1024;
        let path = self.final_path(key);
        if !path.exists() {
            return Err(box_err!("snapshot artifact {} is missing", key));
        }
        let mut reader = BufReader::new(File::open(&path)?);
        let count = reader.read_u64::<BigEndian>()?;
        let mut wb = engine.write_batch();
        for _ in 0..count {
            let klen = reader.read_u32::<BigEndian>()? as usize;
            let mut k = vec![0; klen];
            reader.read_exact(&mut k)?;
            let vlen = reader.read_u32::<BigEndian>()? as usize;
            let mut v = vec![0; vlen];
            reader.read_exact(&mut v)?;
            wb.put(&k, &v)?;
            if wb.count() >= BATCH_KEYS {
                engine.write(&wb)?;
                wb.clear();
                if check_abort() {
                    return Ok(false);
                }
            }
        }
        if !wb.is_empty() {
            engine.write(&wb)?;
        }
        Ok(true)
    }

    /// The newest artifact present for a shard, if any. Used on crash
    /// recovery when the persisted states cannot name the artifact.
    pub fn latest_for_shard(&self, shard_id: u64) -> Option<SnapKey> {
        let prefix = format!("{}_", shard_id);
        let mut best: Option<SnapKey> = None;
        let entries = fs::read_dir(&self.base).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let stem = match name.strip_suffix(".snap") {
                Some(s) => s,
                None => continue,
            };
            if !stem.starts_with(&prefix) {
                continue;
            }
            let mut parts = stem.split('_');
            let parsed = match (parts.next(), parts.next(), parts.next()) {
                (Some(id), Some(term), Some(index)) => {
                    match (id.parse(), term.parse(), index.parse()) {
                        (Ok(id), Ok(term), Ok(index)) => Some((id, term, index)),
                        _ => None,
                    }
                }
                _ => None,
            };
            let (id, term, index): (u64, u64, u64) = match parsed {
                Some(p) => p,
                None => continue,
            };
            if id != shard_id {
                continue;
            }
            let key = SnapKey::new(id, term, index);
            if best.map_or(true, |b| key.index > b.index) {
                best = Some(key);
            }
        }
        best
    }

    /// Removes the artifact once it is no longer needed.
    pub fn delete(&self, key: &SnapKey) {
        let _ = fs::remove_file(self.final_path(key));
        let _ = fs::remove_file(self.tmp_path(key));
        let _ = fs::remove_file(self.recv_path(key));
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }
}

/// Moves one artifact between two managers, holding the Sending
/// registration on the source and the Receiving registration on the
/// target for the duration.
pub fn transfer_snapshot(from: &SnapManager, to: &SnapManager, key: SnapKey) -> Result<()> {
    if !from.register(key, SnapEntry::Sending) {
        return Err(box_err!("snap {} is already being sent", key));
    }
    let res = (|| {
        let payload = from.payload(&key)?;
        if !to.register(key, SnapEntry::Receiving) {
            return Err(box_err!("snap {} is already being received", key));
        }
        let recv = to.receive(&key, payload.as_slice());
        to.deregister(&key, SnapEntry::Receiving);
        recv
    })();
    from.deregister(&key, SnapEntry::Sending);
    res
}

#[cfg(test)]
mod tests {
    use engine_mem::MemEngine;
    use engine_traits::{KvEngine, Peekable};
    use slog::o;

    use super::*;

    fn logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    #[test]
    fn test_register_at_most_one_per_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SnapManager::new(dir.path(), logger());
        let k1 = SnapKey::new(1, 5, 10);
        let k2 = SnapKey::new(1, 5, 12);
        assert!(mgr.register(k1, SnapEntry::Creating));
        assert!(!mgr.register(k2, SnapEntry::Creating));
        // A different stage of the same shard is fine.
        assert!(mgr.register(k1, SnapEntry::Sending));
        // Deregistering with a mismatched key leaves the registration.
        mgr.deregister(&k2, SnapEntry::Creating);
        assert!(mgr.has_registered(1, SnapEntry::Creating));
        mgr.deregister(&k1, SnapEntry::Creating);
        assert!(!mgr.has_registered(1, SnapEntry::Creating));
        assert!(mgr.register(k2, SnapEntry::Creating));
    }

    #[test]
    fn test_create_apply_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SnapManager::new(dir.path(), logger());
        mgr.init().unwrap();

        let src = MemEngine::new();
        src.put_value(b"a1", b"v1");
        src.put_value(b"a2", b"v2");
        src.put_value(b"z9", b"out of range");

        let key = SnapKey::new(1, 5, 10);
        let size = mgr.create(&key, &src.snapshot(), b"a", b"b").unwrap();
        assert!(size > 0);
        // Idempotent: a second create reuses the artifact.
        let size2 = mgr.create(&key, &src.snapshot(), b"a", b"b").unwrap();
        assert_eq!(size, size2);

        let dst = MemEngine::new();
        assert!(mgr.apply(&key, &dst, || false).unwrap());
        assert_eq!(dst.get_value(b"a1").unwrap(), Some(b"v1".to_vec()));
        assert_eq!(dst.get_value(b"a2").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(dst.get_value(b"z9").unwrap(), None);
    }

    #[test]
    fn test_transfer_between_managers() {
        let dir1 = tempfile::tempdir().unwrap();
        let dir2 = tempfile::tempdir().unwrap();
        let src_mgr = SnapManager::new(dir1.path(), logger());
        let dst_mgr = SnapManager::new(dir2.path(), logger());
        src_mgr.init().unwrap();
        dst_mgr.init().unwrap();

        let src = MemEngine::new();
        src.put_value(b"k", b"v");
        let key = SnapKey::new(3, 6, 8);
        src_mgr.create(&key, &src.snapshot(), b"", b"").unwrap();

        transfer_snapshot(&src_mgr, &dst_mgr, key).unwrap();
        assert!(dst_mgr.exists(&key));
        assert!(!src_mgr.has_registered(3, SnapEntry::Sending));
        assert!(!dst_mgr.has_registered(3, SnapEntry::Receiving));
    }
}
