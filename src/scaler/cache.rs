//! Memory cache of scaled chunks.
//!
//! An `ImageScaler` given a cache looks every cell up before submitting a
//! task, so scrolling back over an area or returning to an earlier zoom reuses
//! chunks instead of re-scaling them. Entries are keyed by an xxhash of
//! (version + source id + zoom + mode + rect) and evicted LRU-first once the
//! byte budget is exceeded.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::RwLock;
use tracing::{debug, trace};
use xxhash_rust::xxh3::xxh3_64;

use super::{ScaledChunk, TransformationMode};
use crate::geometry::Rect;

/// Bytes per RGBA pixel.
const BYTES_PER_PIXEL: usize = 4;

/// Bump when scaling output changes so stale keys never match.
const CHUNK_CACHE_VERSION: u8 = 1;

/// Upper bound on entries, independent of the byte budget.
const DEFAULT_LRU_CAPACITY: usize = 4096;

fn chunk_bytes(chunk: &ScaledChunk) -> usize {
    chunk.image.width() as usize * chunk.image.height() as usize * BYTES_PER_PIXEL
}

/// Cache key for chunk lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey(u64);

impl ChunkKey {
    pub fn new(source_id: u64, zoom: f64, mode: TransformationMode, rect: Rect) -> Self {
        let mut data = Vec::with_capacity(1 + 8 + 8 + 1 + 16);
        data.push(CHUNK_CACHE_VERSION);
        data.extend_from_slice(&source_id.to_le_bytes());
        data.extend_from_slice(&zoom.to_bits().to_le_bytes());
        data.push(match mode {
            TransformationMode::Smooth => 0,
            TransformationMode::Fast => 1,
        });
        for v in [rect.x, rect.y, rect.width, rect.height] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Self(xxh3_64(&data))
    }
}

struct Inner {
    entries: LruCache<ChunkKey, ScaledChunk>,
    bytes: usize,
}

pub struct ChunkCache {
    max_bytes: usize,
    inner: RwLock<Inner>,
}

impl ChunkCache {
    pub fn new(max_bytes: usize) -> Self {
        debug!(max_bytes, "Initialized chunk cache");
        Self {
            max_bytes,
            inner: RwLock::new(Inner {
                entries: LruCache::new(
                    NonZeroUsize::new(DEFAULT_LRU_CAPACITY).unwrap_or(NonZeroUsize::MIN),
                ),
                bytes: 0,
            }),
        }
    }

    pub fn get(&self, key: &ChunkKey) -> Option<ScaledChunk> {
        // Write lock: a hit updates recency.
        let mut inner = self.inner.write();
        let hit = inner.entries.get(key).cloned();
        if let Some(chunk) = &hit {
            trace!(rect = ?chunk.rect(), "Chunk cache hit");
        }
        hit
    }

    pub fn contains(&self, key: &ChunkKey) -> bool {
        self.inner.read().entries.contains(key)
    }

    pub fn insert(&self, key: ChunkKey, chunk: &ScaledChunk) {
        let size = chunk_bytes(chunk);
        if size > self.max_bytes {
            trace!(size, "Chunk larger than cache, not storing");
            return;
        }

        let mut inner = self.inner.write();
        // `push` hands back either the replaced value or an entry evicted by
        // the count bound.
        if let Some((_, old)) = inner.entries.push(key, chunk.clone()) {
            inner.bytes -= chunk_bytes(&old);
        }
        inner.bytes += size;

        while inner.bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.bytes -= chunk_bytes(&evicted);
                    trace!(rect = ?evicted.rect(), "Evicted chunk");
                }
                None => break,
            }
        }
    }

    pub fn memory_usage(&self) -> usize {
        self.inner.read().bytes
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.bytes = 0;
        debug!("Cleared chunk cache");
    }
}
