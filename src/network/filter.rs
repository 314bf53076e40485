//! Bounded dedup filters and caches
//!
//! - [`HashFilter`]: recently seen hashes, LRU bounded
//! - [`SentFilter`]: per hash, which peers already have it
//! - [`TimedCache`]: short-lived entries with a hard timeout
//!
//! These are the only structures in the network layer allowed to forget
//! things under pressure. Losing an entry costs a redundant fetch, never
//! a wrong answer.

use lru::LruCache;
use std::collections::HashSet;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

/// Recently seen hashes
pub struct HashFilter {
    inner: Mutex<LruCache<String, Instant>>,
}

impl HashFilter {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity(size))),
        }
    }

    /// Whether the hash was seen; does not refresh its position
    pub fn contains(&self, hash: &str) -> bool {
        self.inner
            .lock()
            .map(|f| f.contains(hash))
            .unwrap_or(false)
    }

    /// Record a hash; returns true if it was new
    pub fn insert(&self, hash: &str) -> bool {
        let Ok(mut filter) = self.inner.lock() else {
            return false;
        };
        filter.put(hash.to_string(), Instant::now()).is_none()
    }

    pub fn remove(&self, hash: &str) -> bool {
        self.inner
            .lock()
            .map(|mut f| f.pop(hash).is_some())
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|f| f.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which peers already hold each hash, so nothing is sent twice
pub struct SentFilter {
    inner: Mutex<LruCache<String, HashSet<String>>>,
}

impl SentFilter {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity(size))),
        }
    }

    /// Mark `hash` as held by `peer`; returns false if it already was
    pub fn mark(&self, hash: &str, peer: &str) -> bool {
        let Ok(mut filter) = self.inner.lock() else {
            return false;
        };
        match filter.get_mut(hash) {
            Some(peers) => peers.insert(peer.to_string()),
            None => {
                let mut peers = HashSet::new();
                peers.insert(peer.to_string());
                filter.put(hash.to_string(), peers);
                true
            }
        }
    }

    /// Whether `peer` already holds `hash`
    pub fn has(&self, hash: &str, peer: &str) -> bool {
        self.inner
            .lock()
            .map(|f| f.peek(hash).map(|p| p.contains(peer)).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Forget everything about a peer (on disconnect)
    pub fn forget_peer(&self, peer: &str) {
        if let Ok(mut filter) = self.inner.lock() {
            for (_, peers) in filter.iter_mut() {
                peers.remove(peer);
            }
        }
    }
}

/// LRU cache whose entries also expire after a fixed timeout
pub struct TimedCache<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, (Instant, V)>>,
    timeout: Duration,
}

impl<K: Hash + Eq + Clone, V: Clone> TimedCache<K, V> {
    pub fn new(size: usize, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity(size))),
            timeout,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(key, (Instant::now(), value));
        }
    }

    /// Insert unless a live entry already holds `key`
    ///
    /// Returns false when the key was taken. Check and insert happen under
    /// one lock.
    pub fn insert_if_absent(&self, key: K, value: V) -> bool {
        let Ok(mut cache) = self.inner.lock() else {
            return false;
        };
        let live = cache
            .peek(&key)
            .map(|(at, _)| at.elapsed() <= self.timeout)
            .unwrap_or(false);
        if live {
            return false;
        }
        cache.put(key, (Instant::now(), value));
        true
    }

    /// Copy of a live entry
    pub fn get(&self, key: &K) -> Option<V> {
        let cache = self.inner.lock().ok()?;
        cache
            .peek(key)
            .filter(|(at, _)| at.elapsed() <= self.timeout)
            .map(|(_, v)| v.clone())
    }

    /// Remove and return a live entry
    pub fn take(&self, key: &K) -> Option<V> {
        let mut cache = self.inner.lock().ok()?;
        cache
            .pop(key)
            .filter(|(at, _)| at.elapsed() <= self.timeout)
            .map(|(_, v)| v)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Drop timed-out entries and return their keys
    pub fn expire(&self) -> Vec<K> {
        let Ok(mut cache) = self.inner.lock() else {
            return Vec::new();
        };
        let expired: Vec<K> = cache
            .iter()
            .filter(|(_, (at, _))| at.elapsed() > self.timeout)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            cache.pop(key);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
