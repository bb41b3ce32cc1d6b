//! LRU (Least Recently Used) cache of decoded compact blocks.
//!
//! Entries are keyed by the area id of the flushed block. An area id is
//! never rewritten with different content, so entries never go stale; they
//! are only dropped by eviction or when the area is freed.

use crate::area::AreaId;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Bytes accounted per allocated entry
const ENTRY_BYTES: usize = std::mem::size_of::<i64>();

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Total number of cache lookups
    pub lookups: u64,
    /// Number of cache hits
    pub hits: u64,
    /// Number of cache misses
    pub misses: u64,
    /// Number of insertions
    pub insertions: u64,
    /// Number of evictions
    pub evictions: u64,
    /// Number of entries dropped because their area was freed
    pub invalidations: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        if self.lookups == 0 {
            0.0
        } else {
            self.hits as f64 / self.lookups as f64
        }
    }

    /// Reset all statistics to zero
    pub fn reset(&mut self) {
        *self = CacheStats::default();
    }
}

#[derive(Debug, Default)]
struct CacheState {
    /// Decoded blocks by area id, with the bytes charged for each
    entries: HashMap<AreaId, (Arc<Vec<i64>>, usize)>,
    /// LRU queue (most recently used at the back)
    lru_queue: VecDeque<AreaId>,
    /// Current cache size in bytes
    size: usize,
}

impl CacheState {
    fn touch(&mut self, id: AreaId) {
        if let Some(pos) = self.lru_queue.iter().position(|k| *k == id) {
            self.lru_queue.remove(pos);
        }
        self.lru_queue.push_back(id);
    }

    fn remove(&mut self, id: AreaId) -> bool {
        match self.entries.remove(&id) {
            Some((_, charged)) => {
                self.size -= charged;
                self.lru_queue.retain(|k| *k != id);
                true
            }
            None => false,
        }
    }
}

/// Thread-safe LRU cache of decoded blocks.
///
/// The recency queue is a `VecDeque`, so touching an entry is O(n) in the
/// number of cached blocks. Block counts stay in the low thousands for the
/// default 8MB capacity.
#[derive(Debug)]
pub struct BlockCache {
    /// Maximum cache capacity in bytes
    capacity: usize,
    /// Entries, recency order and size
    state: Mutex<CacheState>,
    /// Cache statistics
    stats: RwLock<CacheStats>,
}

impl BlockCache {
    /// Create a new BlockCache with the specified capacity.
    ///
    /// # Arguments
    ///
    /// * `capacity` - Maximum cache size in bytes (8 bytes per allocated
    ///   entry, so a block decoded with spare capacity costs more).
    ///   Set to 0 to disable caching.
    ///
    /// # Examples
    ///
    /// ```
    /// use blockdex::cache::BlockCache;
    ///
    /// // Create a 8MB cache
    /// let cache = BlockCache::new(8 * 1024 * 1024);
    /// assert!(cache.is_empty());
    /// ```
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(CacheState::default()),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    /// Get a decoded block from the cache.
    ///
    /// A hit moves the entry to the most recently used position.
    pub fn get(&self, id: AreaId) -> Option<Arc<Vec<i64>>> {
        if self.capacity == 0 {
            self.stats.write().lookups += 1;
            return None;
        }

        let found = {
            let mut state = self.state.lock();
            let found = state.entries.get(&id).map(|(value, _)| Arc::clone(value));
            if found.is_some() {
                state.touch(id);
            }
            found
        };

        let mut stats = self.stats.write();
        stats.lookups += 1;
        if found.is_some() {
            stats.hits += 1;
        } else {
            stats.misses += 1;
        }
        found
    }

    /// Insert a decoded block into the cache.
    ///
    /// If the cache is at capacity, evicts the least recently used blocks
    /// to make room for the new entry.
    pub fn insert(&self, id: AreaId, value: Arc<Vec<i64>>) {
        if self.capacity == 0 {
            return;
        }

        // Charge the allocation; flushed blocks keep spare capacity
        let value_size = value.capacity() * ENTRY_BYTES;

        // Don't cache blocks larger than capacity
        if value_size > self.capacity {
            return;
        }

        let mut evicted = 0;
        {
            let mut state = self.state.lock();
            state.remove(id);

            while state.size + value_size > self.capacity {
                let Some(victim) = state.lru_queue.front().copied() else {
                    break;
                };
                state.remove(victim);
                evicted += 1;
            }

            state.entries.insert(id, (value, value_size));
            state.lru_queue.push_back(id);
            state.size += value_size;
        }

        let mut stats = self.stats.write();
        stats.insertions += 1;
        stats.evictions += evicted;
    }

    /// Drop the entry of a freed area, if cached.
    pub fn invalidate(&self, id: AreaId) {
        if self.state.lock().remove(id) {
            self.stats.write().invalidations += 1;
        }
    }

    /// Get current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.read().clone()
    }

    /// Reset cache statistics to zero.
    pub fn reset_stats(&self) {
        self.stats.write().reset();
    }

    /// Clear all entries from the cache.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.lru_queue.clear();
        state.size = 0;
    }

    /// Get the current size of cached data in bytes.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Get the cache capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of entries in the cache.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
