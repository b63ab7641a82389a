//! # httpfs-cache
//!
//! Bounded pool of per-file byte caches over the range-fetch transport.
//!
//! Each open file gets a cache holding an eagerly-fetched first block
//! plus a small number of larger chunks. Reads are served from cached
//! ranges, fetching a chunk on miss and evicting under memory pressure:
//! the least-recently-used cache when the pool is full, the
//! smallest-offset chunk when a cache's chunk slots are full.
//!
//! All transport, allocation and fetch failures surface as the single
//! [`CacheError::Unavailable`] signal; retry policy belongs to the
//! caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, trace, warn};

use httpfs_fetch::{RangeReader, RangeSource};

/// Maximum number of simultaneously live caches.
pub const MAX_CACHES: usize = 16;

/// Hard cap on chunk slots per cache.
pub const MAX_CHUNKS_PER_CACHE: usize = 8;

/// Default chunk size: the HTTP payload block times 8, a little larger
/// than what `file` reads, so one chunk covers common probing patterns.
pub const DEFAULT_CHUNK_SIZE: usize = 16090 * 8;

/// Smallest accepted chunk size.
pub const MIN_CHUNK_SIZE: usize = 512;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The data could not be produced right now: connection, allocation
    /// or fetch failure. Recoverable; the caller may retry.
    #[error("file data temporarily unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Chunk replacement policy when all slots of a cache are occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplacePolicy {
    /// Replace the chunk with the smallest start offset. Favors the
    /// forward-sequential reads typical of streamed access; it is not
    /// recency-based and can thrash under random access.
    #[default]
    SmallestStart,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Size of each chunk (and of the first block) in bytes.
    pub chunk_size: usize,
    /// Chunk slots per cache, clamped to `1..=MAX_CHUNKS_PER_CACHE`.
    pub chunks_per_cache: usize,
    pub policy: ReplacePolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunks_per_cache: 1,
            policy: ReplacePolicy::default(),
        }
    }
}

/// One contiguous cached byte range. `data.len() == off_end - off_start + 1`.
struct Chunk {
    off_start: u64,
    off_end: u64,
    data: Vec<u8>,
}

struct FileCache {
    path: String,
    total_size: u64,
    #[allow(dead_code)]
    created_at: u64,
    first_block: Option<Vec<u8>>,
    chunks: Vec<Option<Chunk>>,
    chunk_size: usize,
    policy: ReplacePolicy,
    reader: Box<dyn RangeReader>,
}

/// Fallible buffer allocation: `None` instead of aborting on OOM.
fn try_alloc(len: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len).ok()?;
    buf.resize(len, 0);
    Some(buf)
}

impl FileCache {
    /// Open the bound connection for `path`, fetching the first block as
    /// part of establishment. First-block allocation is best effort: on
    /// failure the open degrades to a body-less probe.
    fn open(
        path: &str,
        total_size: u64,
        source: &dyn RangeSource,
        config: &CacheConfig,
        now: u64,
    ) -> Result<FileCache> {
        let fb_len = (config.chunk_size as u64).min(total_size) as usize;
        let mut first_block = try_alloc(fb_len);
        let reader = source
            .open(path, first_block.as_deref_mut())
            .map_err(|e| CacheError::Unavailable(e.to_string()))?;
        Ok(FileCache {
            path: path.to_string(),
            total_size,
            created_at: now,
            first_block,
            chunks: (0..config.chunks_per_cache.clamp(1, MAX_CHUNKS_PER_CACHE))
                .map(|_| None)
                .collect(),
            chunk_size: config.chunk_size,
            policy: config.policy,
            reader,
        })
    }

    /// Find the smallest-offset cached record containing `offset` and
    /// return as much of `[offset, offset + len)` as it covers. The
    /// first block counts as a record at offset 0.
    fn lookup_range(&self, offset: u64, len: usize) -> Option<&[u8]> {
        let mut best: Option<(u64, u64, &[u8])> = None;
        if let Some(fb) = &self.first_block {
            if offset < fb.len() as u64 {
                best = Some((0, fb.len() as u64 - 1, fb.as_slice()));
            }
        }
        for chunk in self.chunks.iter().flatten() {
            if offset >= chunk.off_start && offset <= chunk.off_end {
                let closer = match best {
                    None => true,
                    Some((start, _, _)) => chunk.off_start < start,
                };
                if closer {
                    best = Some((chunk.off_start, chunk.off_end, chunk.data.as_slice()));
                }
            }
        }
        let (start, end, data) = best?;
        let rel = (offset - start) as usize;
        let avail = (end - offset + 1) as usize;
        Some(&data[rel..rel + avail.min(len)])
    }

    /// Fill a chunk slot with data starting at `offset`: a free slot if
    /// one exists, otherwise the policy's victim. A failed fetch frees
    /// the slot; it is never left partially filled.
    fn fetch_chunk(&mut self, offset: u64) -> Result<()> {
        let slot = match self.chunks.iter().position(Option::is_none) {
            Some(free) => free,
            None => self.victim_slot(),
        };
        let mut data = match self.chunks[slot].take() {
            Some(chunk) => chunk.data,
            None => try_alloc(self.chunk_size)
                .ok_or_else(|| CacheError::Unavailable("chunk allocation failed".into()))?,
        };
        let off_end = (offset + self.chunk_size as u64).min(self.total_size) - 1;
        data.resize((off_end - offset + 1) as usize, 0);
        trace!(path = %self.path, offset, off_end, slot, "chunk fetch");
        if let Err(e) = self.reader.read_range(offset, &mut data) {
            warn!(path = %self.path, offset, error = %e, "chunk fetch failed");
            return Err(CacheError::Unavailable(e.to_string()));
        }
        self.chunks[slot] = Some(Chunk {
            off_start: offset,
            off_end,
            data,
        });
        Ok(())
    }

    fn victim_slot(&self) -> usize {
        match self.policy {
            ReplacePolicy::SmallestStart => self
                .chunks
                .iter()
                .enumerate()
                .filter_map(|(i, c)| c.as_ref().map(|c| (i, c.off_start)))
                .min_by_key(|&(_, start)| start)
                .map(|(i, _)| i)
                .unwrap_or(0),
        }
    }

    fn chunk_count(&self) -> usize {
        self.chunks.iter().flatten().count()
    }
}

struct Slot {
    path: String,
    last_used: AtomicU64,
    cache: Arc<Mutex<FileCache>>,
}

/// The bounded cache pool: at most [`MAX_CACHES`] live caches keyed by
/// path, each bound to one connection of the range source.
pub struct CachePool {
    config: CacheConfig,
    source: Box<dyn RangeSource>,
    slots: Mutex<Vec<Option<Slot>>>,
    /// Monotonic tick driving last-used ordering; coarser wall-clock
    /// timestamps would tie within one second.
    clock: AtomicU64,
}

impl CachePool {
    pub fn new(config: CacheConfig, source: Box<dyn RangeSource>) -> CachePool {
        CachePool {
            config,
            source,
            slots: Mutex::new((0..MAX_CACHES).map(|_| None).collect()),
            clock: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Read up to `len` bytes of `path` at `offset`.
    ///
    /// Zero-length requests and requests at or past end of file return
    /// an empty buffer and create no cache. The result may be shorter
    /// than `len` when the covering record ends early; the caller loops
    /// with the advanced offset, the cache performs no coalescing across
    /// calls.
    pub fn read(&self, total_size: u64, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 || offset >= total_size {
            return Ok(Vec::new());
        }
        let cache = self.lookup_or_create(path, total_size)?;
        let mut cache = cache.lock().unwrap();
        // The cache may have been created with a different size than the
        // caller's; clamp against the cached bound, never underflow.
        let len = len.min(cache.total_size.saturating_sub(offset) as usize);
        if len == 0 {
            return Ok(Vec::new());
        }
        if let Some(data) = cache.lookup_range(offset, len) {
            return Ok(data.to_vec());
        }
        cache.fetch_chunk(offset)?;
        match cache.lookup_range(offset, len) {
            Some(data) => Ok(data.to_vec()),
            // One fetch, one retry; a second miss means the request
            // cannot be satisfied right now.
            None => Err(CacheError::Unavailable(format!(
                "no data for {path} at offset {offset} after fetch"
            ))),
        }
    }

    /// Create (or touch) the cache for `path`, e.g. at file-open time.
    pub fn ensure(&self, path: &str, total_size: u64) -> Result<()> {
        self.lookup_or_create(path, total_size).map(|_| ())
    }

    /// Release the cache for `path`: first block, chunks and connection.
    /// A path without a live cache is a no-op.
    pub fn destroy(&self, path: &str) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.path == path) {
                *slot = None;
                debug!(path, "cache destroyed");
                return;
            }
        }
    }

    /// Destroy every live cache. Required before the tree index is
    /// reloaded: stale size/path bindings must not outlive the tree that
    /// produced them.
    pub fn destroy_all(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.iter_mut() {
            *slot = None;
        }
        debug!("all caches destroyed");
    }

    pub fn contains(&self, path: &str) -> bool {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .any(|s| s.path == path)
    }

    /// Number of live caches.
    pub fn live(&self) -> usize {
        self.slots.lock().unwrap().iter().flatten().count()
    }

    /// Chunks currently held for `path` (diagnostics).
    pub fn chunk_count(&self, path: &str) -> usize {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .find(|s| s.path == path)
            .map(|s| s.cache.lock().unwrap().chunk_count())
            .unwrap_or(0)
    }

    /// Find the live cache for `path` or create one, evicting the cache
    /// with the oldest last use when all slots are taken. The whole
    /// find-free-or-evict decision runs under the table lock so eviction
    /// and destruction cannot interleave; an evicted cache that is still
    /// mid-read finishes on its own handle and is dropped afterwards.
    fn lookup_or_create(&self, path: &str, total_size: u64) -> Result<Arc<Mutex<FileCache>>> {
        let mut slots = self.slots.lock().unwrap();
        let now = self.clock.fetch_add(1, Ordering::Relaxed);

        if let Some(slot) = slots.iter().flatten().find(|s| s.path == path) {
            slot.last_used.store(now, Ordering::Relaxed);
            return Ok(slot.cache.clone());
        }

        let index = match slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                let (victim, _) = slots
                    .iter()
                    .enumerate()
                    .filter_map(|(i, s)| {
                        s.as_ref().map(|s| (i, s.last_used.load(Ordering::Relaxed)))
                    })
                    .min_by_key(|&(_, used)| used)
                    .expect("full pool has at least one slot");
                debug!(
                    evicted = %slots[victim].as_ref().map(|s| s.path.as_str()).unwrap_or(""),
                    "evicting oldest cache"
                );
                slots[victim] = None;
                victim
            }
        };

        let cache = FileCache::open(path, total_size, &*self.source, &self.config, now)?;
        let cache = Arc::new(Mutex::new(cache));
        slots[index] = Some(Slot {
            path: path.to_string(),
            last_used: AtomicU64::new(now),
            cache: cache.clone(),
        });
        debug!(path, total_size, "cache created");
        Ok(cache)
    }
}
