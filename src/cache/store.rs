//! TTL key/value store with pattern invalidation.
//!
//! Entries are visible only while `now < expires_at`. Expired entries are
//! dropped lazily when a read finds them and periodically by a sweeper task,
//! so keys that are never read again do not pin memory.
//!
//! All methods take `&self`; locking is internal so the store can be shared
//! between feed owners and the sweeper behind an `Arc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::cache::key::KeyPattern;

/// A stored value and its expiry deadline.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    /// Whether the entry may still be returned to readers.
    pub fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Point-in-time store counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries dropped because their TTL ran out.
    pub expired: u64,
    /// Entries dropped by explicit or pattern invalidation.
    pub evicted: u64,
    /// Entries currently held, including expired ones not yet swept.
    pub entries: usize,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evicted: AtomicU64,
}

/// Concurrent TTL cache keyed by string.
#[derive(Debug)]
pub struct TtlStore<V> {
    label: String,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    counters: Counters,
}

impl<V: Clone> TtlStore<V> {
    /// Create an empty store. `label` identifies it in logs.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: RwLock::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Look up a live entry. An expired entry is removed and reported as absent.
    pub fn get(&self, key: impl AsRef<str>) -> Option<V> {
        let key = key.as_ref();
        let now = Instant::now();

        {
            let entries = self.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => {}
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        }

        // Lazy eviction. Re-check under the write lock: a writer may have
        // replaced the entry in between.
        let mut entries = self.entries.write();
        if let Some(entry) = entries.get(key) {
            if entry.is_live(now) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            entries.remove(key);
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            trace!(store = %self.label, key, "Expired on read");
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or overwrite; the entry expires `ttl` from now.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.write().insert(key.into(), CacheEntry::new(value, ttl));
    }

    /// Return the live value for `key`, inserting `make()` with `ttl` if there
    /// is none. The check and the insert happen under one lock.
    pub fn get_or_insert_with(
        &self,
        key: impl AsRef<str>,
        ttl: Duration,
        make: impl FnOnce() -> V,
    ) -> V {
        let key = key.as_ref();
        let now = Instant::now();
        let mut entries = self.entries.write();

        if let Some(entry) = entries.get(key) {
            if entry.is_live(now) {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return entry.value.clone();
            }
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let value = make();
        entries.insert(key.to_string(), CacheEntry::new(value.clone(), ttl));
        value
    }

    /// Push the expiry of a live entry to `ttl` from now.
    ///
    /// Returns `false` (and changes nothing) when the key is absent or expired,
    /// so a refresh never resurrects an invalidated entry.
    pub fn refresh(&self, key: impl AsRef<str>, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        match entries.get_mut(key.as_ref()) {
            Some(entry) if entry.is_live(now) => {
                entry.expires_at = now + ttl;
                true
            }
            _ => false,
        }
    }

    /// Remove exactly one entry.
    pub fn invalidate(&self, key: impl AsRef<str>) -> bool {
        let removed = self.entries.write().remove(key.as_ref()).is_some();
        if removed {
            self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Remove every key matching `pattern`. Returns how many were removed.
    pub fn invalidate_pattern(&self, pattern: &KeyPattern) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|key, _| !pattern.matches(key));
        let removed = before - entries.len();
        drop(entries);

        if removed > 0 {
            self.counters.evicted.fetch_add(removed as u64, Ordering::Relaxed);
            debug!(store = %self.label, %pattern, removed, "Pattern invalidation");
        }
        removed
    }

    /// Like [`invalidate_pattern`](Self::invalidate_pattern), but hands the
    /// removed values back so the caller can release them.
    pub fn remove_matching(&self, pattern: &KeyPattern) -> Vec<V> {
        let mut entries = self.entries.write();
        let keys: Vec<String> = entries
            .keys()
            .filter(|key| pattern.matches(key))
            .cloned()
            .collect();
        let removed: Vec<V> = keys
            .iter()
            .filter_map(|key| entries.remove(key))
            .map(|entry| entry.value)
            .collect();
        drop(entries);

        self.counters.evicted.fetch_add(removed.len() as u64, Ordering::Relaxed);
        removed
    }

    /// Remove everything.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries.write();
        let removed = entries.len();
        entries.clear();
        self.counters.evicted.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Drop all expired entries. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let purged = before - entries.len();
        self.counters.expired.fetch_add(purged as u64, Ordering::Relaxed);
        purged
    }

    /// Number of entries held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

/// Type-erased view of a store, used by components that evict by key pattern
/// without knowing the value type.
pub trait Evictable: Send + Sync {
    fn label(&self) -> &str;

    /// Remove every key matching `pattern`.
    fn evict_matching(&self, pattern: &KeyPattern) -> usize;

    /// Drop expired entries.
    fn purge_expired(&self) -> usize;
}

impl<V: Clone + Send + Sync> Evictable for TtlStore<V> {
    fn label(&self) -> &str {
        TtlStore::label(self)
    }

    fn evict_matching(&self, pattern: &KeyPattern) -> usize {
        self.invalidate_pattern(pattern)
    }

    fn purge_expired(&self) -> usize {
        TtlStore::purge_expired(self)
    }
}

/// Spawn a task that purges expired entries every `every`.
///
/// The task holds only a weak reference: it exits when the store is dropped
/// or when `cancel` fires.
pub fn spawn_sweeper<S>(store: &Arc<S>, every: Duration, cancel: CancellationToken) -> JoinHandle<()>
where
    S: Evictable + ?Sized + 'static,
{
    let weak: Weak<S> = Arc::downgrade(store);

    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(store) = weak.upgrade() else {
                break;
            };
            let purged = store.purge_expired();
            if purged > 0 {
                debug!(store = store.label(), purged, "Sweep complete");
            }
        }
    })
}
