//! Address book
//!
//! Durable registry of known peer addresses with per-address dial
//! statistics, the set of addresses that are our own, and the node's
//! long-term identity key.
//!
//! Entries are only removed by an explicit [`AddrBook::remove`]. Selection
//! is biased by a win/loss ratio so consistently failing addresses are
//! tried less often without being dropped.

use crate::crypto::{KeyError, KeyPair};
use crate::network::message::MAX_ADDR_PER_MESSAGE;
use crate::network::netaddress::NetAddress;
use crate::storage::{KvStore, StorageError};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

// =============================================================================
// Constants
// =============================================================================

/// Key prefix for address records
pub const ADDR_PREFIX: &str = "addr/";

/// Key of the node's private key
pub const PRIVKEY_KEY: &str = "node/privkey";

/// Failures without a single success after which an address is not shared
const TERRIBLE_FAILURES: u32 = 5;

// =============================================================================
// Address Entry
// =============================================================================

/// A known address and its dial history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddrEntry {
    pub addr: NetAddress,
    /// Peer (or "seed") that told us about it
    pub source: Option<String>,
    pub attempts: u32,
    pub successes: u32,
    pub failures: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

impl AddrEntry {
    pub fn new(addr: NetAddress, source: Option<String>) -> Self {
        Self {
            addr,
            source,
            attempts: 0,
            successes: 0,
            failures: 0,
            last_attempt: None,
            last_success: None,
        }
    }

    /// Never worked and keeps failing
    pub fn is_terrible(&self) -> bool {
        self.successes == 0 && self.failures >= TERRIBLE_FAILURES
    }

    /// Selection weight from the win/loss ratio
    pub fn get_chance(&self) -> f64 {
        let wins = self.successes as f64 + 1.0;
        let total = (self.successes + self.failures) as f64 + 2.0;
        (wins / total).max(0.01)
    }

    fn record(&mut self, success: bool) {
        let now = Utc::now();
        self.attempts += 1;
        self.last_attempt = Some(now);
        if success {
            self.successes += 1;
            self.last_success = Some(now);
        } else {
            self.failures += 1;
        }
    }
}

// =============================================================================
// Address Book
// =============================================================================

/// Known addresses, our own addresses and the identity key
pub struct AddrBook {
    entries: Mutex<HashMap<String, AddrEntry>>,
    ours: Mutex<HashSet<String>>,
    key: RwLock<KeyPair>,
    store: Arc<KvStore>,
}

impl AddrBook {
    /// Load the book and identity key from `store`
    ///
    /// Corrupt address records are skipped. A missing or unreadable key is
    /// replaced by a freshly generated one.
    pub fn new(store: Arc<KvStore>) -> Result<Self, StorageError> {
        let mut entries = HashMap::new();
        for (_, entry) in store.scan_prefix::<AddrEntry>(ADDR_PREFIX)? {
            entries.insert(entry.addr.to_string(), entry);
        }

        let key = match store.get::<String>(PRIVKEY_KEY) {
            Ok(Some(hex_key)) => match KeyPair::from_private_key_hex(&hex_key) {
                Ok(key) => Some(key),
                Err(e) => {
                    log::warn!("Stored node key is invalid ({}), generating a new one", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("Stored node key is unreadable ({}), generating a new one", e);
                None
            }
        };
        let key = match key {
            Some(key) => key,
            None => {
                let key = KeyPair::generate();
                store.put(PRIVKEY_KEY, &key.private_key_hex())?;
                store.flush()?;
                key
            }
        };

        log::info!(
            "Address book loaded: {} addresses, identity {}",
            entries.len(),
            key.public_key_hex()
        );

        Ok(Self {
            entries: Mutex::new(entries),
            ours: Mutex::new(HashSet::new()),
            key: RwLock::new(key),
            store,
        })
    }

    /// Add an address; returns true if it was unknown
    pub fn add(&self, addr: NetAddress, source: Option<String>) -> bool {
        if self.is_our_address(&addr) {
            return false;
        }
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let key = addr.to_string();
        if entries.contains_key(&key) {
            return false;
        }
        let entry = AddrEntry::new(addr, source);
        if let Err(e) = self.store.put(&record_key(&key), &entry) {
            log::warn!("Failed to store address {}: {}", key, e);
        }
        entries.insert(key, entry);
        true
    }

    /// Add addresses received in an Addr message
    pub fn add_many(&self, addrs: &[String], source: &str) -> usize {
        let mut added = 0;
        for raw in addrs.iter().take(MAX_ADDR_PER_MESSAGE) {
            match NetAddress::parse(raw) {
                Ok(addr) => {
                    if self.add(addr, Some(source.to_string())) {
                        added += 1;
                    }
                }
                Err(e) => log::debug!("Ignoring address {} from {}: {}", raw, source, e),
            }
        }
        added
    }

    /// Mark an address as ours so it is never dialed
    pub fn add_our_address(&self, addr: &NetAddress) {
        if let Ok(mut ours) = self.ours.lock() {
            ours.insert(addr.to_string());
        }
    }

    pub fn is_our_address(&self, addr: &NetAddress) -> bool {
        self.ours
            .lock()
            .map(|ours| ours.contains(addr.as_str()))
            .unwrap_or(false)
    }

    /// Record the outcome of a dial to `addr`. Returns whether the address was known.
    pub fn record_attempt(&self, addr: &NetAddress, success: bool) -> bool {
        let Ok(mut entries) = self.entries.lock() else {
            return false;
        };
        let Some(entry) = entries.get_mut(addr.as_str()) else {
            return false;
        };
        entry.record(success);
        if let Err(e) = self.store.put(&record_key(addr.as_str()), &*entry) {
            log::warn!("Failed to store address {}: {}", addr, e);
        }
        true
    }

    pub fn get(&self, addr: &NetAddress) -> Option<AddrEntry> {
        self.entries.lock().ok()?.get(addr.as_str()).cloned()
    }

    /// Pick up to `count` dial candidates, weighted by their win/loss ratio
    pub fn select(&self, exclude: &HashSet<String>, count: usize) -> Vec<NetAddress> {
        let mut candidates: Vec<AddrEntry> = {
            let Ok(entries) = self.entries.lock() else {
                return Vec::new();
            };
            entries
                .values()
                .filter(|e| !exclude.contains(e.addr.as_str()) && !self.is_our_address(&e.addr))
                .cloned()
                .collect()
        };

        let mut rng = rand::thread_rng();
        let mut picked = Vec::new();
        while picked.len() < count && !candidates.is_empty() {
            let total: f64 = candidates.iter().map(|e| e.get_chance()).sum();
            let mut target = rng.gen::<f64>() * total;
            let mut index = candidates.len() - 1;
            for (i, entry) in candidates.iter().enumerate() {
                target -= entry.get_chance();
                if target <= 0.0 {
                    index = i;
                    break;
                }
            }
            picked.push(candidates.swap_remove(index).addr);
        }
        picked
    }

    /// Addresses to share in response to GetAddr
    pub fn get_addrs(&self, count: usize) -> Vec<String> {
        let mut addrs: Vec<String> = match self.entries.lock() {
            Ok(entries) => entries
                .values()
                .filter(|e| !e.is_terrible())
                .map(|e| e.addr.to_string())
                .collect(),
            Err(_) => return Vec::new(),
        };
        addrs.shuffle(&mut rand::thread_rng());
        addrs.truncate(count.min(MAX_ADDR_PER_MESSAGE));
        addrs
    }

    /// Explicitly forget an address
    pub fn remove(&self, addr: &NetAddress) -> bool {
        let removed = self
            .entries
            .lock()
            .map(|mut entries| entries.remove(addr.as_str()).is_some())
            .unwrap_or(false);
        if removed {
            let _ = self.store.delete(&record_key(addr.as_str()));
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every entry and flush the store
    pub fn persist(&self) -> Result<(), StorageError> {
        let snapshot: Vec<AddrEntry> = match self.entries.lock() {
            Ok(entries) => entries.values().cloned().collect(),
            Err(_) => return Err(StorageError::Poisoned),
        };
        for entry in &snapshot {
            self.store.put(&record_key(entry.addr.as_str()), entry)?;
        }
        self.store.flush()
    }

    // =========================================================================
    // Identity key
    // =========================================================================

    /// Our identity name
    pub fn public_key_hex(&self) -> String {
        self.key
            .read()
            .map(|k| k.public_key_hex())
            .unwrap_or_default()
    }

    /// Sign with the identity key
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        match self.key.read() {
            Ok(key) => key.sign(message),
            Err(_) => Err(KeyError::InvalidPrivateKey),
        }
    }

    /// Copy of the key pair for the handshake
    pub fn key_pair(&self) -> Option<KeyPair> {
        self.key.read().ok().map(|k| k.clone())
    }

    /// Replace the identity key with a fresh one and persist it
    pub fn reset_key(&self) -> Result<String, StorageError> {
        let key = KeyPair::generate();
        self.store.put(PRIVKEY_KEY, &key.private_key_hex())?;
        self.store.flush()?;
        let name = key.public_key_hex();
        if let Ok(mut current) = self.key.write() {
            *current = key;
        }
        Ok(name)
    }
}

fn record_key(addr: &str) -> String {
    format!("{}{}", ADDR_PREFIX, addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn addr(s: &str) -> NetAddress {
        NetAddress::parse(s).unwrap()
    }

    #[test]
    fn test_add_is_idempotent() {
        let book = AddrBook::new(Arc::new(KvStore::in_memory())).unwrap();
        let a = addr("8.8.8.8:13802");
        assert!(book.add(a.clone(), None));
        book.record_attempt(&a, false);

        assert!(!book.add(a.clone(), Some("other".into())));
        assert_eq!(book.len(), 1);
        let entry = book.get(&a).unwrap();
        assert_eq!(entry.failures, 1);
        assert_eq!(entry.successes, 0);
        assert!(entry.source.is_none());
    }

    #[test]
    fn test_record_attempt_keeps_entries() {
        let book = AddrBook::new(Arc::new(KvStore::in_memory())).unwrap();
        let known = addr("8.8.8.8:13802");
        book.add(known.clone(), None);

        assert!(!book.record_attempt(&addr("8.8.4.4:13802"), false));
        assert!(book.record_attempt(&known, false));
        assert_eq!(book.len(), 1);
        assert_eq!(book.get(&known).unwrap().failures, 1);
    }

    #[test]
    fn test_our_addresses_never_added_or_selected() {
        let book = AddrBook::new(Arc::new(KvStore::in_memory())).unwrap();
        let me = addr("10.0.0.1:13802");
        book.add_our_address(&me);
        assert!(book.is_our_address(&me));
        assert!(!book.add(me, None));
        assert!(book.select(&HashSet::new(), 10).is_empty());
    }

    #[test]
    fn test_select_respects_exclusions() {
        let book = AddrBook::new(Arc::new(KvStore::in_memory())).unwrap();
        for i in 1..=5 {
            book.add(addr(&format!("8.8.8.{}:13802", i)), None);
        }
        let mut exclude = HashSet::new();
        exclude.insert("8.8.8.1:13802".to_string());

        let picked = book.select(&exclude, 10);
        assert_eq!(picked.len(), 4);
        assert!(picked.iter().all(|a| a.as_str() != "8.8.8.1:13802"));
        assert_eq!(book.select(&HashSet::new(), 2).len(), 2);
    }

    #[test]
    fn test_failures_lower_chance() {
        let mut good = AddrEntry::new(addr("8.8.8.8:1"), None);
        let mut bad = AddrEntry::new(addr("8.8.4.4:1"), None);
        good.record(true);
        for _ in 0..TERRIBLE_FAILURES {
            bad.record(false);
        }
        assert!(good.get_chance() > bad.get_chance());
        assert!(bad.is_terrible());
        assert!(!good.is_terrible());
    }

    #[test]
    fn test_terrible_addresses_not_shared() {
        let book = AddrBook::new(Arc::new(KvStore::in_memory())).unwrap();
        let bad = addr("8.8.4.4:13802");
        book.add(addr("8.8.8.8:13802"), None);
        book.add(bad.clone(), None);
        for _ in 0..TERRIBLE_FAILURES {
            book.record_attempt(&bad, false);
        }
        assert_eq!(book.get_addrs(10), vec!["8.8.8.8:13802".to_string()]);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempdir().unwrap();
        let name = {
            let store = Arc::new(KvStore::open(dir.path()).unwrap());
            let book = AddrBook::new(store).unwrap();
            let a = addr("1.2.3.4:13802");
            book.add(a.clone(), Some("seed".into()));
            book.record_attempt(&a, true);
            book.persist().unwrap();
            book.public_key_hex()
        };

        let store = Arc::new(KvStore::open(dir.path()).unwrap());
        let book = AddrBook::new(store).unwrap();
        assert_eq!(book.public_key_hex(), name);
        let entry = book.get(&addr("1.2.3.4:13802")).unwrap();
        assert_eq!(entry.successes, 1);
        assert_eq!(entry.source.as_deref(), Some("seed"));
    }

    #[test]
    fn test_corrupt_record_skipped() {
        let store = Arc::new(KvStore::in_memory());
        store
            .put(&record_key("5.6.7.8:13802"), &AddrEntry::new(addr("5.6.7.8:13802"), None))
            .unwrap();
        store
            .put_raw(&record_key("garbage"), "{not json".to_string())
            .unwrap();

        let book = AddrBook::new(store).unwrap();
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_sign_with_identity() {
        let book = AddrBook::new(Arc::new(KvStore::in_memory())).unwrap();
        let sig = book.sign(b"nonce").unwrap();
        let key = book.key_pair().unwrap();
        assert!(key.verify(b"nonce", &sig).unwrap());

        let old = book.public_key_hex();
        let new = book.reset_key().unwrap();
        assert_ne!(old, new);
        assert_eq!(book.public_key_hex(), new);
    }
}
