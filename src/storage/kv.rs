//! JSON key-value store
//!
//! Every record is kept as its own JSON document under a string key, so a
//! record that no longer parses is skipped on read instead of failing the
//! whole store. The file is rewritten with write-to-temp then atomic
//! rename. A store file that cannot be parsed at all is moved aside and
//! the node starts with an empty store.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Name of the store file inside the data directory
pub const STORE_FILE: &str = "gossip.json";

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
    #[error("Store lock poisoned")]
    Poisoned,
}

/// Persistent key-value store backed by one JSON file
pub struct KvStore {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<String, String>>,
}

impl KvStore {
    /// Open (or create) the store inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(STORE_FILE);
        let records = if path.exists() {
            Self::read_file(&path)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    /// A store that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    fn read_file(path: &Path) -> Result<BTreeMap<String, String>, StorageError> {
        let file = fs::File::open(path)?;
        match serde_json::from_reader(BufReader::new(file)) {
            Ok(records) => Ok(records),
            Err(e) => {
                let aside = path.with_extension("json.corrupt");
                log::warn!(
                    "Store file {} is unreadable ({}), moving it to {}",
                    path.display(),
                    e,
                    aside.display()
                );
                fs::rename(path, &aside)?;
                Ok(BTreeMap::new())
            }
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, StorageError> {
        self.records.lock().map_err(|_| StorageError::Poisoned)
    }

    /// Read and decode one record
    ///
    /// A record that fails to decode is reported as an error; callers that
    /// load many records use [`KvStore::scan_prefix`], which skips them.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let records = self.lock()?;
        match records.get(key) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }

    /// Encode and store one record (in memory until [`KvStore::flush`])
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let raw = serde_json::to_string(value)?;
        self.put_raw(key, raw)
    }

    /// Store an already encoded record
    pub fn put_raw(&self, key: &str, raw: String) -> Result<(), StorageError> {
        self.lock()?.insert(key.to_string(), raw);
        Ok(())
    }

    /// Remove a record
    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.lock()?.remove(key).is_some())
    }

    /// Decode every record whose key starts with `prefix`
    ///
    /// Records that fail to decode are logged and skipped.
    pub fn scan_prefix<T: DeserializeOwned>(
        &self,
        prefix: &str,
    ) -> Result<Vec<(String, T)>, StorageError> {
        let records = self.lock()?;
        let mut out = Vec::new();
        for (key, raw) in records.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            match serde_json::from_str(raw) {
                Ok(value) => out.push((key.clone(), value)),
                Err(e) => log::warn!("Skipping corrupt record {}: {}", key, e),
            }
        }
        Ok(out)
    }

    /// Remove every record whose key starts with `prefix`
    pub fn clear_prefix(&self, prefix: &str) -> Result<usize, StorageError> {
        let mut records = self.lock()?;
        let before = records.len();
        records.retain(|k, _| !k.starts_with(prefix));
        Ok(before - records.len())
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write all records to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let snapshot = self.lock()?.clone();

        // Write to temporary file first
        let temp_path = path.with_extension("json.tmp");
        let file = fs::File::create(&temp_path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &snapshot)?;

        // Atomic rename
        fs::rename(&temp_path, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        count: u32,
    }

    #[test]
    fn test_put_get_flush_reopen() {
        let dir = tempdir().unwrap();
        let store = KvStore::open(dir.path()).unwrap();
        store
            .put(
                "addr/1.2.3.4:13802",
                &Record {
                    name: "a".into(),
                    count: 3,
                },
            )
            .unwrap();
        store.flush().unwrap();

        let reopened = KvStore::open(dir.path()).unwrap();
        let record: Record = reopened.get("addr/1.2.3.4:13802").unwrap().unwrap();
        assert_eq!(record.count, 3);
    }

    #[test]
    fn test_scan_prefix_skips_corrupt_records() {
        let store = KvStore::in_memory();
        store
            .put(
                "addr/a",
                &Record {
                    name: "a".into(),
                    count: 1,
                },
            )
            .unwrap();
        store.put_raw("addr/b", "{not json".to_string()).unwrap();
        store
            .put(
                "addr/c",
                &Record {
                    name: "c".into(),
                    count: 2,
                },
            )
            .unwrap();
        store.put("node/privkey", &"deadbeef").unwrap();

        let records: Vec<(String, Record)> = store.scan_prefix("addr/").unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].1.name, "a");
        assert_eq!(records[1].1.name, "c");
    }

    #[test]
    fn test_corrupt_file_moved_aside() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(STORE_FILE), b"garbage").unwrap();

        let store = KvStore::open(dir.path()).unwrap();
        assert!(store.is_empty());
        assert!(dir.path().join("gossip.json.corrupt").exists());
    }

    #[test]
    fn test_delete_and_clear_prefix() {
        let store = KvStore::in_memory();
        store.put("cert/1", &1u32).unwrap();
        store.put("cert/2", &2u32).unwrap();
        store.put("addr/x", &3u32).unwrap();

        assert!(store.delete("cert/1").unwrap());
        assert!(!store.delete("cert/1").unwrap());
        assert_eq!(store.clear_prefix("cert/").unwrap(), 1);
        assert_eq!(store.len(), 1);
    }
}
