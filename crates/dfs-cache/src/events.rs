use dfs_types::PackExt;

/// An index-type entry (idx, bitmap, reverse index) was requested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexRequested {
    pub ext: PackExt,
    pub cache_hit: bool,
    /// Time spent loading on a miss; zero on a hit.
    pub load_micros: u64,
    pub size: usize,
    /// Time since the last eviction of this extension, if any happened.
    pub micros_since_last_eviction: Option<u64>,
}

/// An index-type entry was evicted from the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEvicted {
    pub ext: PackExt,
    pub size: usize,
    pub total_hits: u64,
    pub micros_since_last_eviction: Option<u64>,
}

/// Observer for index traffic through the block cache.
///
/// Callbacks run on the requesting thread, eviction callbacks while the
/// clock lock is held. Keep them cheap.
pub trait IndexEventListener: Send + Sync {
    fn on_index_requested(&self, event: &IndexRequested);

    /// Opt in to eviction callbacks.
    fn is_evict_listener_enabled(&self) -> bool {
        false
    }

    fn on_index_evicted(&self, _event: &IndexEvicted) {}
}
