use std::sync::Arc;

use dfs_cache::FileOpener;
use dfs_types::{ObjectId, ObjectType};
use flate2::Decompress;
use serde::{Deserialize, Serialize};

use crate::delta_base_cache::DeltaBaseCache;
use crate::error::PackResult;
use crate::large_object::ObjectLoader;

/// Tuning for object readers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderOptions {
    /// Byte budget of the per-reader delta base cache.
    pub delta_base_cache_limit: usize,
    /// Whole objects at least this large are streamed instead of inflated.
    pub stream_file_threshold: u64,
    /// Read-ahead requested when copying a whole pack; 0 uses the block size.
    pub stream_pack_buffer_size: usize,
    /// Skip unreachable-garbage packs in object lookups.
    pub avoid_unreachable_objects: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            delta_base_cache_limit: 10 * 1024 * 1024, // 10 MiB
            stream_file_threshold: 50 * 1024 * 1024,  // 50 MiB
            stream_pack_buffer_size: 0,
            avoid_unreachable_objects: false,
        }
    }
}

/// I/O counters kept by one reader.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderStats {
    pub index_loads: u64,
    pub index_bytes: u64,
    pub bitmap_loads: u64,
    pub objects_loaded: u64,
    pub deltas_applied: u64,
    pub delta_base_cache_hits: u64,
    pub inflated_bytes: u64,
    pub large_objects: u64,
    pub as_is_copies: u64,
    pub as_is_bytes: u64,
    pub corrupt_objects: u64,
}

/// Re-resolves an object in the current pack set when the pack it was
/// found in has gone away.
pub type ReopenFn = Arc<dyn Fn(&ObjectId, ObjectType) -> PackResult<ObjectLoader> + Send + Sync>;

/// Per-reader state shared by every pack it touches. Not thread-safe; each
/// thread uses its own.
pub struct ReadContext {
    options: ReaderOptions,
    opener: Arc<dyn FileOpener>,
    pub(crate) base_cache: DeltaBaseCache,
    pub(crate) inflater: Decompress,
    pub(crate) stats: ReaderStats,
    reopen: Option<ReopenFn>,
}

impl ReadContext {
    pub fn new(opener: Arc<dyn FileOpener>, options: ReaderOptions) -> Self {
        Self {
            base_cache: DeltaBaseCache::new(options.delta_base_cache_limit),
            inflater: Decompress::new(true),
            stats: ReaderStats::default(),
            reopen: None,
            options,
            opener,
        }
    }

    /// Hook used by large-object streams to find a replacement pack.
    pub fn with_reopen(mut self, reopen: ReopenFn) -> Self {
        self.reopen = Some(reopen);
        self
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    pub fn opener(&self) -> &Arc<dyn FileOpener> {
        &self.opener
    }

    pub fn reopen(&self) -> Option<&ReopenFn> {
        self.reopen.as_ref()
    }

    pub fn stats(&self) -> &ReaderStats {
        &self.stats
    }

    pub fn base_cache(&self) -> &DeltaBaseCache {
        &self.base_cache
    }

    /// Drop cached delta bases.
    pub fn release(&mut self) {
        self.base_cache.clear();
    }
}

impl std::fmt::Debug for ReadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadContext")
            .field("options", &self.options)
            .field("base_cache", &self.base_cache)
            .field("stats", &self.stats)
            .finish()
    }
}
