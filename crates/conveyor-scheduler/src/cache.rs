//! Expiring in-memory key/value cache.
//!
//! Used to memoize recently-read job/step status so queries do not hit
//! the store on every call. Reads take a shared lock, writes an
//! exclusive one; expired entries are evicted lazily on `get` and
//! proactively by a background sweep so keys that are never re-read do
//! not accumulate.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

struct CacheEntry<V> {
    value: V,
    /// `None` = never expires.
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Thread-safe expiring key/value store.
///
/// Must be created inside a Tokio runtime when a sweep interval is
/// configured, since the sweep runs as a background task.
pub struct TtlCache<K, V> {
    entries: Arc<RwLock<HashMap<K, CacheEntry<V>>>>,
    closed: AtomicBool,
    sweeper: CancellationToken,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache. A zero `sweep_interval` disables the background
    /// sweep; expired entries are then only evicted when read.
    pub fn new(sweep_interval: Duration) -> Self {
        let entries: Arc<RwLock<HashMap<K, CacheEntry<V>>>> =
            Arc::new(RwLock::new(HashMap::new()));
        let sweeper = CancellationToken::new();

        if !sweep_interval.is_zero() {
            let entries = Arc::clone(&entries);
            let token = sweeper.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(sweep_interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {
                            let now = Instant::now();
                            let mut map =
                                entries.write().unwrap_or_else(PoisonError::into_inner);
                            map.retain(|_, e| !e.is_expired(now));
                        }
                    }
                }
            });
        }

        Self {
            entries,
            closed: AtomicBool::new(false),
            sweeper,
        }
    }

    /// Store a value. A zero `ttl` means the entry never expires.
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let expires_at = (!ttl.is_zero()).then(|| Instant::now() + ttl);
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(key, CacheEntry { value, expires_at });
    }

    /// Value for `key` if present and unexpired. An expired entry is
    /// evicted on the way out.
    pub fn get(&self, key: &K) -> Option<V> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let now = Instant::now();
        {
            let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match map.get(key) {
                None => return None,
                Some(e) if !e.is_expired(now) => return Some(e.value.clone()),
                Some(_) => {}
            }
        }
        // Expired: re-check under the write lock (the entry may have
        // been overwritten since the read) and evict.
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(e) = map.get(key) {
            if e.is_expired(now) {
                map.remove(key);
            } else {
                return Some(e.value.clone());
            }
        }
        None
    }

    /// Remove an entry unconditionally.
    pub fn delete(&self, key: &K) {
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        map.remove(key);
    }

    /// Stop the sweep and clear all entries. Safe to call more than
    /// once; only the first call does anything.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.sweeper.cancel();
        let mut map = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        map.clear();
    }

    pub fn len(&self) -> usize {
        let map = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Drop for TtlCache<K, V> {
    fn drop(&mut self) {
        self.sweeper.cancel();
    }
}
