//! RocksDB-backed consensus log storage.
//!
//! All operations are synchronous blocking I/O over a small, hot key set;
//! RocksDB is internally thread-safe, so no external lock is needed.

use rbft_core::{Storage, StorageError};
use rocksdb::{IteratorMode, Options, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// RocksDB tuning knobs for the consensus log.
#[derive(Debug, Clone)]
pub struct RocksDbConfig {
    /// Background compaction/flush jobs.
    pub max_background_jobs: i32,
    /// Write buffer size in bytes.
    pub write_buffer_size: usize,
    /// Number of write buffers.
    pub max_write_buffer_number: i32,
    /// Number of info log files retained.
    pub keep_log_file_num: usize,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        RocksDbConfig {
            max_background_jobs: 2,
            write_buffer_size: 16 << 20,
            max_write_buffer_number: 2,
            keep_log_file_num: 4,
        }
    }
}

/// RocksDB implementation of the consensus-log [`Storage`] surface.
pub struct RocksDbStorage {
    db: Arc<DB>,
}

impl RocksDbStorage {
    /// Open or create a database at `path` with default tuning.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<RocksDbStorage, StorageError> {
        Self::open_with_config(path, RocksDbConfig::default())
    }

    /// Open with custom tuning.
    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: RocksDbConfig,
    ) -> Result<RocksDbStorage, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_background_jobs(config.max_background_jobs);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(config.max_write_buffer_number);
        opts.set_keep_log_file_num(config.keep_log_file_num);

        let db = DB::open(&opts, path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(RocksDbStorage { db: Arc::new(db) })
    }

    fn prefixed(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.db
            .iterator(IteratorMode::From(
                prefix.as_bytes(),
                rocksdb::Direction::Forward,
            ))
            .filter_map(|item| item.ok())
            .map_while(|(key, value)| {
                let key = String::from_utf8(key.to_vec()).ok()?;
                key.starts_with(prefix).then(|| (key, value.to_vec()))
            })
            .collect()
    }
}

impl Storage for RocksDbStorage {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.db
            .put(key.as_bytes(), value)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.db.get(key.as_bytes()).ok().flatten()
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.db
            .delete(key.as_bytes())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn iterate(&self, prefix: &str) -> BTreeMap<String, Vec<u8>> {
        self.prefixed(prefix).into_iter().collect()
    }

    fn destroy(&self, prefix: &str) -> Result<(), StorageError> {
        for (key, _) in self.prefixed(prefix) {
            self.db
                .delete(key.as_bytes())
                .map_err(|e| StorageError::Backend(e.to_string()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> (RocksDbStorage, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "rbft-storage-test-{}-{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let _ = std::fs::remove_dir_all(&path);
        (RocksDbStorage::open(&path).unwrap(), path)
    }

    #[test]
    fn round_trip_and_prefix_scan() {
        let (storage, path) = temp_db();
        storage.put("h", b"1").unwrap();
        storage.put("chkpt.10", b"a").unwrap();
        storage.put("chkpt.20", b"b").unwrap();
        storage.put("view", b"v").unwrap();

        assert_eq!(storage.get("h"), Some(b"1".to_vec()));
        let chkpts = storage.iterate("chkpt.");
        assert_eq!(chkpts.len(), 2);

        storage.destroy("chkpt.").unwrap();
        assert!(storage.iterate("chkpt.").is_empty());
        assert_eq!(storage.get("view"), Some(b"v".to_vec()));

        drop(storage);
        let _ = std::fs::remove_dir_all(path);
    }
}
