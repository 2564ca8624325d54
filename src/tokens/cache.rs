//! In-memory cache for derived (internal and notebook) tokens.
//!
//! Two bounded LRU structures share the same capacity: a fingerprint →
//! serialized-handle cache, and a fingerprint → async-mutex lock table. The
//! lock table is what gives derivation its single-flight guarantee: the
//! lookup-or-mint sequence for one fingerprint runs under that
//! fingerprint's lock, so racing requests observe the first caller's
//! result instead of minting duplicates.
//!
//! Evicting a lock entry only drops the table's reference; in-flight
//! holders keep theirs, and the next request simply creates a fresh lock.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Cache and lock table for derived tokens, keyed by fingerprint.
pub struct TokenCache {
    handles: Mutex<LruCache<String, String>>,
    locks: Mutex<LruCache<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenCache {
    /// Create with the given capacity (entries, not bytes).
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero; the configuration default is 10 000 and
    /// validation rejects zero before this point.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).expect("token cache capacity must be nonzero");
        Self {
            handles: Mutex::new(LruCache::new(capacity)),
            locks: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// The serialized handle cached for this fingerprint, if any.
    #[must_use]
    pub fn get(&self, fingerprint: &str) -> Option<String> {
        self.handles.lock().get(fingerprint).cloned()
    }

    /// Cache the serialized handle for a fingerprint.
    pub fn store(&self, fingerprint: &str, handle: &str) {
        self.handles
            .lock()
            .put(fingerprint.to_string(), handle.to_string());
    }

    /// Drop a cached entry (e.g., after its record turned out to be gone).
    pub fn invalidate(&self, fingerprint: &str) {
        self.handles.lock().pop(fingerprint);
    }

    /// The per-fingerprint derivation lock.
    #[must_use]
    pub fn lock(&self, fingerprint: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(fingerprint) {
            return Arc::clone(lock);
        }
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.put(fingerprint.to_string(), Arc::clone(&lock));
        lock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_get_invalidate() {
        let cache = TokenCache::new(4);
        assert!(cache.get("fp").is_none());

        cache.store("fp", "gafaelfawr-k.s");
        assert_eq!(cache.get("fp").as_deref(), Some("gafaelfawr-k.s"));

        cache.invalidate("fp");
        assert!(cache.get("fp").is_none());
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let cache = TokenCache::new(2);
        cache.store("a", "1");
        cache.store("b", "2");
        cache.store("c", "3");
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn same_fingerprint_returns_same_lock() {
        let cache = TokenCache::new(4);
        let a = cache.lock("fp");
        let b = cache.lock("fp");
        assert!(Arc::ptr_eq(&a, &b));

        let c = cache.lock("other");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn lock_serializes_critical_sections() {
        let cache = Arc::new(TokenCache::new(4));
        let counter = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let counter = Arc::clone(&counter);
            tasks.push(tokio::spawn(async move {
                let lock = cache.lock("fp");
                let _guard = lock.lock().await;
                // Mimic lookup-or-mint: only the first entrant "mints".
                if cache.get("fp").is_none() {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    cache.store("fp", "minted");
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
