//! Generic time-bounded cache shared by provider, template, and budget
//! caching so expiry and invalidation-on-write behave the same for every
//! artifact class.

use sente_core::is_fresh;
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    loaded_unix_ms: u64,
}

/// String-keyed cache whose entries expire `ttl_ms` after load.
///
/// `get` treats a stale entry as a miss and evicts it; explicit writes go
/// through `invalidate` so a just-disabled provider or rewritten template is
/// never served for the remainder of a TTL window.
#[derive(Debug)]
pub struct TimedCache<T: Clone> {
    ttl_ms: u64,
    entries: Mutex<HashMap<String, CacheEntry<T>>>,
}

impl<T: Clone> TimedCache<T> {
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn get(&self, key: &str, now_unix_ms: u64) -> Option<T> {
        let mut entries = lock_or_recover(&self.entries);
        let fresh = entries
            .get(key)
            .map(|entry| is_fresh(entry.loaded_unix_ms, self.ttl_ms, now_unix_ms));
        match fresh {
            Some(true) => entries.get(key).map(|entry| entry.value.clone()),
            Some(false) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, key: impl Into<String>, value: T, now_unix_ms: u64) {
        let mut entries = lock_or_recover(&self.entries);
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                loaded_unix_ms: now_unix_ms,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        let mut entries = lock_or_recover(&self.entries);
        entries.remove(key);
    }

    pub fn clear(&self) {
        let mut entries = lock_or_recover(&self.entries);
        entries.clear();
    }

    /// Drops every expired entry, returning how many were evicted.
    pub fn purge_expired(&self, now_unix_ms: u64) -> usize {
        let mut entries = lock_or_recover(&self.entries);
        let before = entries.len();
        entries.retain(|_, entry| is_fresh(entry.loaded_unix_ms, self.ttl_ms, now_unix_ms));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub(crate) fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
