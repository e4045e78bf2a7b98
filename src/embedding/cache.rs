//! Content-fingerprinted embedding cache
//!
//! Entries are keyed by document id and tagged with a fingerprint of the
//! content they were computed from. A fingerprint change makes the entry
//! stale; the next `get_or_compute` replaces it atomically.
//!
//! Concurrent misses for the same key share one in-flight slot, so the
//! compute function runs at most once at a time per key.

use ahash::AHashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::OnceCell;
use tracing::debug;

/// Cached embedding with the fingerprint of its source content
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub vector: Vec<f32>,
    pub content_fingerprint: String,
}

struct InFlight {
    fingerprint: String,
    slot: Arc<OnceCell<Arc<CacheEntry>>>,
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub computations: u64,
}

#[derive(Default)]
pub struct EmbeddingCache {
    entries: RwLock<AHashMap<String, Arc<CacheEntry>>>,
    in_flight: Mutex<AHashMap<String, InFlight>>,
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached vector for `key` when its fingerprint matches, otherwise
    /// compute, store and return a fresh one.
    ///
    /// Callers racing on the same key and fingerprint await the single
    /// computation already in flight. A failed computation is not cached; the
    /// next waiter retries with its own compute function.
    pub async fn get_or_compute<F, Fut, E>(
        &self,
        key: &str,
        content_hash: &str,
        compute: F,
    ) -> Result<Vec<f32>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<f32>, E>>,
    {
        if let Some(entry) = self.lookup(key, content_hash) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(entry.vector.clone());
        }

        let slot = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);

            // A computation may have landed between the lookup above and taking the lock
            if let Some(entry) = self.lookup(key, content_hash) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.vector.clone());
            }

            match in_flight.get(key) {
                Some(pending) if pending.fingerprint == content_hash => pending.slot.clone(),
                _ => {
                    let slot = Arc::new(OnceCell::new());
                    in_flight.insert(
                        key.to_string(),
                        InFlight {
                            fingerprint: content_hash.to_string(),
                            slot: slot.clone(),
                        },
                    );
                    slot
                }
            }
        };

        self.misses.fetch_add(1, Ordering::Relaxed);

        let entry = slot
            .get_or_try_init(|| async {
                self.computations.fetch_add(1, Ordering::Relaxed);
                debug!("Computing embedding for {}", key);
                let vector = compute().await?;
                let entry = Arc::new(CacheEntry {
                    key: key.to_string(),
                    vector,
                    content_fingerprint: content_hash.to_string(),
                });
                self.store(entry.clone(), &slot);
                Ok::<_, E>(entry)
            })
            .await?;

        Ok(entry.vector.clone())
    }

    /// Seed the cache with a vector computed elsewhere (e.g. loaded from disk)
    pub fn insert(&self, key: &str, content_hash: &str, vector: Vec<f32>) {
        let entry = Arc::new(CacheEntry {
            key: key.to_string(),
            vector,
            content_fingerprint: content_hash.to_string(),
        });
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), entry);
    }

    /// Cached vector for `key` if it was computed from `content_hash`; counts as a hit
    pub fn fresh(&self, key: &str, content_hash: &str) -> Option<Vec<f32>> {
        let entry = self.lookup(key, content_hash)?;
        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.vector.clone())
    }

    /// Current entry for `key`, regardless of fingerprint
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .map(|e| e.as_ref().clone())
    }

    /// True when a cached entry exists but was computed from other content
    pub fn is_stale(&self, key: &str, content_hash: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .is_some_and(|e| e.content_fingerprint != content_hash)
    }

    /// Drop the entry for `key` (administrative purge)
    pub fn invalidate(&self, key: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, key: &str, content_hash: &str) -> Option<Arc<CacheEntry>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .filter(|e| e.content_fingerprint == content_hash)
            .cloned()
    }

    /// Publish `entry` only while `slot` is still the registered computation
    /// for its key. A slot replaced by a newer fingerprint or dropped by
    /// `invalidate` still answers its own waiters but is never cached.
    fn store(&self, entry: Arc<CacheEntry>, slot: &Arc<OnceCell<Arc<CacheEntry>>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let current = in_flight
            .get(&entry.key)
            .is_some_and(|pending| Arc::ptr_eq(&pending.slot, slot));
        if !current {
            debug!("Discarding superseded embedding for {}", entry.key);
            return;
        }
        in_flight.remove(&entry.key);
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(entry.key.clone(), entry);
    }
}

/// blake3 fingerprint of embedding-relevant content
pub fn fingerprint(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_hit_skips_compute() {
        let cache = EmbeddingCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let v = cache
                .get_or_compute("cmaj7", "fp-1", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(vec![1.0, 2.0])
                })
                .await
                .unwrap();
            assert_eq!(v, vec![1.0, 2.0]);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.computations, 1);
    }

    #[tokio::test]
    async fn test_fingerprint_change_recomputes() {
        let cache = EmbeddingCache::new();
        cache
            .get_or_compute("g7", "old", || async { Ok::<_, String>(vec![1.0]) })
            .await
            .unwrap();
        assert!(cache.is_stale("g7", "new"));

        let v = cache
            .get_or_compute("g7", "new", || async { Ok::<_, String>(vec![2.0]) })
            .await
            .unwrap();
        assert_eq!(v, vec![2.0]);
        assert_eq!(cache.get("g7").unwrap().content_fingerprint, "new");
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_collapse() {
        let cache = Arc::new(EmbeddingCache::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("am7", "fp", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(vec![0.5; 4])
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), vec![0.5; 4]);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_not_cached() {
        let cache = EmbeddingCache::new();
        let err = cache
            .get_or_compute("d7", "fp", || async { Err::<Vec<f32>, _>("model offline") })
            .await;
        assert_eq!(err.unwrap_err(), "model offline");
        assert!(cache.is_empty());

        let ok = cache
            .get_or_compute("d7", "fp", || async { Ok::<_, &str>(vec![3.0]) })
            .await
            .unwrap();
        assert_eq!(ok, vec![3.0]);
    }

    #[tokio::test]
    async fn test_late_old_fingerprint_does_not_overwrite_newer() {
        let cache = Arc::new(EmbeddingCache::new());

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("g7", "old", || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, String>(vec![1.0])
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let fresh = cache
            .get_or_compute("g7", "new", || async { Ok::<_, String>(vec![2.0]) })
            .await
            .unwrap();
        assert_eq!(fresh, vec![2.0]);

        // The slow caller still gets its own result
        assert_eq!(slow.await.unwrap().unwrap(), vec![1.0]);

        let stored = cache.get("g7").unwrap();
        assert_eq!(stored.content_fingerprint, "new");
        assert_eq!(stored.vector, vec![2.0]);

        let calls = AtomicUsize::new(0);
        cache
            .get_or_compute("g7", "new", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(vec![9.0])
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalidate_during_compute_stays_purged() {
        let cache = Arc::new(EmbeddingCache::new());

        let pending = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_compute("d7", "fp", || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, String>(vec![1.0])
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate("d7");

        assert_eq!(pending.await.unwrap().unwrap(), vec![1.0]);
        assert!(cache.get("d7").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_and_fingerprint() {
        let cache = EmbeddingCache::new();
        cache.insert("c6", &fingerprint("C6 x32210"), vec![1.0]);
        assert_eq!(fingerprint("C6 x32210"), fingerprint("C6 x32210"));
        assert_ne!(fingerprint("C6 x32210"), fingerprint("C6 x35553"));
        assert!(cache.invalidate("c6"));
        assert!(!cache.invalidate("c6"));
        assert!(cache.get("c6").is_none());
    }
}
