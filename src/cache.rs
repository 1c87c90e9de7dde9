//! Bounded LRU over completed chunks.
//!
//! Keyed by chunk id, used by the HTTP layer to avoid re-reading and
//! re-decoding a chunk file for every offset query. Only completed
//! chunks may be inserted; the mutable current chunk is always fetched
//! fresh from storage.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

use crate::metrics;
use crate::storage::Chunk;

pub struct Options {
    /// Maximum number of chunks retained.
    pub size: usize,
}

pub struct ChunkCache {
    items: Mutex<LruCache<i64, Chunk>>,
}

impl ChunkCache {
    pub fn new(options: &Options) -> Self {
        let size = NonZeroUsize::new(options.size.max(1)).unwrap();
        Self { items: Mutex::new(LruCache::new(size)) }
    }

    /// Look up a chunk, promoting it to most recently used.
    pub fn get(&self, id: i64) -> Option<Chunk> {
        let mut items = self.items.lock().unwrap();
        match items.get(&id) {
            Some(chunk) => {
                metrics::CACHE_HITS.inc();
                Some(chunk.clone())
            }
            None => {
                metrics::CACHE_MISSES.inc();
                None
            }
        }
    }

    /// Insert a chunk, evicting the least recently used entry when the
    /// capacity is exceeded. An existing entry is promoted but never
    /// overwritten; returns whether an insertion took place.
    pub fn put(&self, id: i64, chunk: Chunk) -> bool {
        let mut items = self.items.lock().unwrap();
        if items.contains(&id) {
            items.promote(&id);
            return false;
        }
        items.put(id, chunk);
        true
    }

    /// Drop all entries.
    pub fn reset(&self) {
        self.items.lock().unwrap().clear();
    }
}
