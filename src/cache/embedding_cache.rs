use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Thread-safe LRU cache for query embeddings
///
/// Keys combine the embedding model and the query text, so one cache can be
/// shared by embedders configured with different models. Vector runs issue the
/// same question once per example, but `retrieve` and repeated runs in one
/// process hit the cache.
pub struct EmbeddingCache {
    cache: Mutex<LruCache<(String, String), Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a new embedding cache with the specified capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum number of embeddings to cache (0 is treated as 1)
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);

        Self {
            cache: Mutex::new(LruCache::new(cap)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    // A panic while holding the lock cannot leave the LRU half-updated in a
    // way that matters for a cache, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, LruCache<(String, String), Vec<f32>>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up the embedding of `query` under `model`
    ///
    /// # Returns
    ///
    /// Some(embedding) if found in cache, None otherwise
    pub fn get(&self, model: &str, query: &str) -> Option<Vec<f32>> {
        let found = self
            .lock()
            .get(&(model.to_string(), query.to_string()))
            .cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Store the embedding of `query` under `model`
    pub fn put(&self, model: &str, query: &str, embedding: Vec<f32>) {
        self.lock()
            .put((model.to_string(), query.to_string()), embedding);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// `(hits, misses)` since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}
