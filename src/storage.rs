//! RocksDB key-value layer
//!
//! Thin wrapper over a shared `DB` handle: point reads, atomic batches and
//! ordered prefix scans. Record layouts live in `game_store`.

use crate::errors::{SpinwheelError, SpinwheelResult, StorageError};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;

#[derive(Clone)]
pub struct KvStorage {
    db: Arc<DB>,
}

/// Group of writes applied atomically by [`KvStorage::write`]
#[derive(Default)]
pub struct StorageBatch {
    batch: WriteBatch,
    len: usize,
}

impl StorageBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) {
        self.batch.put(key, value);
        self.len += 1;
    }

    pub fn delete(&mut self, key: impl AsRef<[u8]>) {
        self.batch.delete(key);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl KvStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> SpinwheelResult<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_write_buffer_size(32 * 1024 * 1024);
        opts.set_max_write_buffer_number(3);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path.as_ref()).map_err(|e| {
            SpinwheelError::Storage(StorageError::DatabaseOpenFailed(format!(
                "{}: {}",
                path.as_ref().display(),
                e
            )))
        })?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Remove any existing database at `path`, then open a fresh one
    pub fn open_clean<P: AsRef<Path>>(path: P) -> SpinwheelResult<Self> {
        if path.as_ref().exists() {
            tracing::warn!(path = %path.as_ref().display(), "Clearing database on start");
            DB::destroy(&Options::default(), path.as_ref()).map_err(|e| {
                SpinwheelError::Storage(StorageError::DatabaseOpenFailed(e.to_string()))
            })?;
        }
        Self::open(path)
    }

    pub fn get(&self, key: &[u8]) -> SpinwheelResult<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map_err(|e| SpinwheelError::Storage(StorageError::ReadFailed(e.to_string())))
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> SpinwheelResult<()> {
        self.db
            .put(key, value)
            .map_err(|e| SpinwheelError::Storage(StorageError::WriteFailed(e.to_string())))
    }

    pub fn write(&self, batch: StorageBatch) -> SpinwheelResult<()> {
        self.db
            .write(batch.batch)
            .map_err(|e| SpinwheelError::Storage(StorageError::WriteFailed(e.to_string())))
    }

    /// Up to `limit` entries under `prefix` in key order, starting strictly after `after`
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> SpinwheelResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let start = after.unwrap_or(prefix);
        let mut rows = Vec::new();

        for item in self.db.iterator(IteratorMode::From(start, Direction::Forward)) {
            let (key, value) =
                item.map_err(|e| SpinwheelError::Storage(StorageError::ReadFailed(e.to_string())))?;
            if !key.starts_with(prefix) {
                break;
            }
            if after.map_or(false, |a| a == &key[..]) {
                continue;
            }
            rows.push((key.to_vec(), value.to_vec()));
            if rows.len() >= limit {
                break;
            }
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_batch_and_prefix_scan() {
        let dir = TempDir::new().unwrap();
        let storage = KvStorage::open(dir.path()).unwrap();

        let mut batch = StorageBatch::new();
        batch.put(b"a:1", b"one");
        batch.put(b"a:2", b"two");
        batch.put(b"a:3", b"three");
        batch.put(b"b:1", b"other");
        assert_eq!(batch.len(), 4);
        storage.write(batch).unwrap();

        let rows = storage.scan_prefix(b"a:", None, 10).unwrap();
        assert_eq!(rows.len(), 3);

        let page = storage.scan_prefix(b"a:", Some(b"a:1"), 1).unwrap();
        assert_eq!(page, vec![(b"a:2".to_vec(), b"two".to_vec())]);
    }

    #[test]
    fn test_delete_in_batch() {
        let dir = TempDir::new().unwrap();
        let storage = KvStorage::open(dir.path()).unwrap();
        storage.put(b"k", b"v").unwrap();

        let mut batch = StorageBatch::new();
        batch.delete(b"k");
        storage.write(batch).unwrap();

        assert_eq!(storage.get(b"k").unwrap(), None);
    }

    #[test]
    fn test_open_clean_discards_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db");
        {
            let storage = KvStorage::open(&path).unwrap();
            storage.put(b"k", b"v").unwrap();
        }
        let storage = KvStorage::open_clean(&path).unwrap();
        assert_eq!(storage.get(b"k").unwrap(), None);
    }
}
