//! In-memory storage backend.

use crate::{Storage, StorageError};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// A `BTreeMap`-backed [`Storage`] for tests and single-process clusters.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    map: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.map.read().expect("storage lock").len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.map
            .write()
            .expect("storage lock")
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.map.read().expect("storage lock").get(key).cloned()
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.map.write().expect("storage lock").remove(key);
        Ok(())
    }

    fn iterate(&self, prefix: &str) -> BTreeMap<String, Vec<u8>> {
        self.map
            .read()
            .expect("storage lock")
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn destroy(&self, prefix: &str) -> Result<(), StorageError> {
        let mut map = self.map.write().expect("storage lock");
        let keys: Vec<String> = map
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            map.remove(&key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_get_delete() {
        let s = MemoryStorage::new();
        s.put("a", b"1").unwrap();
        assert_eq!(s.get("a"), Some(b"1".to_vec()));
        s.delete("a").unwrap();
        assert_eq!(s.get("a"), None);
    }

    #[test]
    fn iterate_by_prefix() {
        let s = MemoryStorage::new();
        s.put("qpc.v0.n1", b"a").unwrap();
        s.put("qpc.v0.n2", b"b").unwrap();
        s.put("batch.x", b"c").unwrap();
        let qpc = s.iterate("qpc.");
        assert_eq!(qpc.len(), 2);
        assert!(qpc.contains_key("qpc.v0.n1"));
    }

    #[test]
    fn destroy_prefix() {
        let s = MemoryStorage::new();
        s.put("chkpt.1", b"a").unwrap();
        s.put("chkpt.2", b"b").unwrap();
        s.put("view", b"c").unwrap();
        s.destroy("chkpt.").unwrap();
        assert!(s.iterate("chkpt.").is_empty());
        assert_eq!(s.get("view"), Some(b"c".to_vec()));
    }
}
