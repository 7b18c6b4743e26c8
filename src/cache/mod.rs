//! Decoded chunk cache
//!
//! Keeps recently decoded archive chunks in memory so sequential reads
//! of a compressed chunk decode it once.

mod lru;

pub use lru::LruCache;

use crate::config::CacheConfig;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Cache key: body offset of the owning entry and chunk index
pub type ChunkKey = (u64, u32);

/// Cache statistics
#[derive(Debug, Clone)]
pub struct CacheStats {
    /// Bytes currently held
    pub current_size: u64,
    /// Configured capacity in bytes
    pub max_size: u64,
    /// Number of cached chunks
    pub chunk_count: usize,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
}

struct CacheInner {
    entries: HashMap<ChunkKey, Arc<Vec<u8>>>,
    lru: LruCache<ChunkKey>,
    current_size: u64,
    hits: u64,
    misses: u64,
}

/// Size-bounded LRU cache of decoded chunks
pub struct ChunkCache {
    max_size: u64,
    inner: Mutex<CacheInner>,
}

impl ChunkCache {
    /// Create a cache from configuration
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.max_size)
    }

    /// Create a cache holding at most `max_size` bytes
    pub fn with_capacity(max_size: u64) -> Self {
        ChunkCache {
            max_size,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                lru: LruCache::new(),
                current_size: 0,
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Look up a decoded chunk
    pub fn get(&self, key: &ChunkKey) -> Option<Arc<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.entries.get(key).cloned() {
            Some(data) => {
                inner.hits += 1;
                inner.lru.touch(key);
                Some(data)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert a decoded chunk, evicting least recently used chunks
    pub fn insert(&self, key: ChunkKey, data: Arc<Vec<u8>>) {
        let size = data.len() as u64;
        if size > self.max_size {
            return;
        }

        let mut inner = self.inner.lock();
        if let Some(old) = inner.entries.remove(&key) {
            inner.current_size -= old.len() as u64;
            inner.lru.remove(&key);
        }

        while inner.current_size + size > self.max_size {
            let Some(victim) = inner.lru.pop_oldest() else {
                break;
            };
            if let Some(evicted) = inner.entries.remove(&victim) {
                inner.current_size -= evicted.len() as u64;
            }
        }

        inner.entries.insert(key, data);
        inner.lru.insert(key);
        inner.current_size += size;
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            current_size: inner.current_size,
            max_size: self.max_size,
            chunk_count: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_insert() {
        let cache = ChunkCache::with_capacity(1024);
        assert!(cache.get(&(0, 0)).is_none());

        cache.insert((0, 0), Arc::new(vec![1u8; 100]));
        assert_eq!(cache.get(&(0, 0)).unwrap().len(), 100);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.current_size, 100);
    }

    #[test]
    fn test_eviction_respects_capacity() {
        let cache = ChunkCache::with_capacity(250);

        cache.insert((0, 0), Arc::new(vec![0u8; 100]));
        cache.insert((0, 1), Arc::new(vec![0u8; 100]));
        cache.get(&(0, 0));
        cache.insert((0, 2), Arc::new(vec![0u8; 100]));

        assert!(cache.get(&(0, 0)).is_some());
        assert!(cache.get(&(0, 1)).is_none());
        assert!(cache.get(&(0, 2)).is_some());
        assert!(cache.stats().current_size <= 250);
    }

    #[test]
    fn test_oversized_chunk_is_not_cached() {
        let cache = ChunkCache::with_capacity(10);
        cache.insert((0, 0), Arc::new(vec![0u8; 11]));
        assert_eq!(cache.stats().chunk_count, 0);
    }
}
