//! Bounded, TTL-expiring in-memory store for ephemeral session state.
//!
//! Eviction is by insertion order (oldest written first), not access order.
//! Expired entries are treated as absent and removed on the read that finds
//! them; `cleanup()` reclaims the rest proactively.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Default time-to-live for a session (24 hours).
pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);
/// Default capacity (10,000 sessions).
pub const DEFAULT_MAX_SIZE: usize = 10_000;

struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    /// Position in `CacheInner::order`.
    seq: u64,
}

struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Insertion sequence -> key. The first entry is the eviction candidate.
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl<V> CacheInner<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn insert(&mut self, key: String, value: V, now: Instant) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                seq,
            },
        );
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_first() {
            self.entries.remove(&key);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
    pub ttl_seconds: u64,
}

pub struct SessionCache<V> {
    ttl: Duration,
    max_size: usize,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> SessionCache<V> {
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
            }),
        }
    }

    fn is_expired(&self, entry: &CacheEntry<V>, now: Instant) -> bool {
        now.saturating_duration_since(entry.created_at) > self.ttl
    }

    /// Stores `value`, resetting its timestamp and moving it to the newest
    /// position. Evicts oldest entries until the cache is back within bounds.
    pub fn put(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let now = Instant::now();
        let mut inner = self.inner.lock();

        inner.remove(&key);
        inner.insert(key, value, now);

        while inner.entries.len() > self.max_size {
            inner.evict_oldest();
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = self.is_expired(inner.entries.get(key)?, now);
        if expired {
            inner.remove(key);
            return None;
        }
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => return false,
            Some(entry) => self.is_expired(entry, now),
        };
        if expired {
            inner.remove(key);
        }
        !expired
    }

    /// Read-modify-write of a live entry within one critical section.
    ///
    /// Counts as a write: the entry's timestamp is refreshed and it moves to
    /// the newest position. Returns `false` if the key is absent or expired.
    pub fn update<F>(&self, key: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut V),
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let Some(mut entry) = inner.remove(key) else {
            return false;
        };
        if self.is_expired(&entry, now) {
            return false;
        }

        mutate(&mut entry.value);
        inner.insert(key.to_string(), entry.value, now);
        true
    }

    /// Removes every expired entry. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.remove(key);
        }
        expired.len()
    }

    /// Physical entry count, including expired entries not yet reclaimed.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            max_size: self.max_size,
            ttl_seconds: self.ttl.as_secs(),
        }
    }
}
