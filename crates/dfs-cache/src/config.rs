use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dfs_types::PackExt;
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, CacheResult};
use crate::events::IndexEventListener;

/// Default memory budget: 32 MiB.
pub const DEFAULT_BLOCK_LIMIT: u64 = 32 * 1024 * 1024;
/// Default block size: 64 KiB.
pub const DEFAULT_BLOCK_SIZE: u32 = 64 * 1024;
/// Default fraction of the budget a single copied file may occupy.
pub const DEFAULT_STREAM_RATIO: f64 = 0.30;
/// Default number of load and ref lock stripes.
pub const DEFAULT_CONCURRENCY_LEVEL: usize = 32;
/// Default hotness cap for extensions without an override.
pub const DEFAULT_HOT_MAX: u8 = 1;

/// Smallest block size accepted.
pub const MIN_BLOCK_SIZE: u32 = 512;

/// Configuration for a [`BlockCache`](crate::BlockCache).
///
/// Loadable from TOML:
///
/// ```toml
/// block_limit = 67108864
/// block_size = 65536
///
/// [hot_max]
/// idx = 3
/// ```
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockCacheConfig {
    /// Maximum live bytes held by the cache (default: 32 MiB).
    pub block_limit: u64,
    /// Size of one cached block; a power of two (default: 64 KiB).
    pub block_size: u32,
    /// Files up to `block_limit * stream_ratio` bytes are copied through
    /// the cache; larger ones bypass it.
    pub stream_ratio: f64,
    /// Number of lock stripes for loads and for typed references.
    pub concurrency_level: usize,
    /// Per-extension hotness cap, keyed by file extension (`"idx"`).
    pub hot_max: BTreeMap<String, u8>,
    /// Receives index request and eviction events.
    #[serde(skip)]
    pub index_event_listener: Option<Arc<dyn IndexEventListener>>,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            block_limit: DEFAULT_BLOCK_LIMIT,
            block_size: DEFAULT_BLOCK_SIZE,
            stream_ratio: DEFAULT_STREAM_RATIO,
            concurrency_level: DEFAULT_CONCURRENCY_LEVEL,
            hot_max: BTreeMap::new(),
            index_event_listener: None,
        }
    }
}

impl BlockCacheConfig {
    /// Parse and validate a TOML configuration.
    pub fn from_toml_str(s: &str) -> CacheResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| CacheError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_block_limit(mut self, bytes: u64) -> Self {
        self.block_limit = bytes;
        self
    }

    pub fn with_block_size(mut self, bytes: u32) -> Self {
        self.block_size = bytes;
        self
    }

    pub fn with_stream_ratio(mut self, ratio: f64) -> Self {
        self.stream_ratio = ratio;
        self
    }

    pub fn with_concurrency_level(mut self, level: usize) -> Self {
        self.concurrency_level = level;
        self
    }

    pub fn with_hot_max(mut self, ext: PackExt, cap: u8) -> Self {
        self.hot_max.insert(ext.extension().to_string(), cap);
        self
    }

    pub fn with_index_event_listener(mut self, listener: Arc<dyn IndexEventListener>) -> Self {
        self.index_event_listener = Some(listener);
        self
    }

    /// Check every field, returning the first problem found.
    pub fn validate(&self) -> CacheResult<()> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(CacheError::InvalidConfig(format!(
                "block_size {} is below the minimum of {MIN_BLOCK_SIZE}",
                self.block_size
            )));
        }
        if !self.block_size.is_power_of_two() {
            return Err(CacheError::InvalidConfig(format!(
                "block_size {} is not a power of two",
                self.block_size
            )));
        }
        if self.block_limit < u64::from(self.block_size) {
            return Err(CacheError::InvalidConfig(format!(
                "block_limit {} cannot hold one block of {} bytes",
                self.block_limit, self.block_size
            )));
        }
        if !(0.0..=1.0).contains(&self.stream_ratio) {
            return Err(CacheError::InvalidConfig(format!(
                "stream_ratio {} is outside [0, 1]",
                self.stream_ratio
            )));
        }
        if self.concurrency_level == 0 {
            return Err(CacheError::InvalidConfig(
                "concurrency_level must be at least 1".into(),
            ));
        }
        for name in self.hot_max.keys() {
            PackExt::from_extension(name)
                .map_err(|e| CacheError::InvalidConfig(format!("hot_max: {e}")))?;
        }
        Ok(())
    }

    /// Hotness caps indexed by extension position.
    pub fn hot_caps(&self) -> [u8; PackExt::COUNT] {
        let mut caps = [DEFAULT_HOT_MAX; PackExt::COUNT];
        for (name, cap) in &self.hot_max {
            if let Ok(ext) = PackExt::from_extension(name) {
                caps[ext.position()] = *cap;
            }
        }
        caps
    }

    /// Number of hash table slots for this budget.
    pub fn table_size(&self) -> usize {
        let blocks = self.block_limit / u64::from(self.block_size.max(1));
        let slots = (5 * blocks / 2).min(i32::MAX as u64);
        (slots as usize).max(1)
    }
}

impl fmt::Debug for BlockCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCacheConfig")
            .field("block_limit", &self.block_limit)
            .field("block_size", &self.block_size)
            .field("stream_ratio", &self.stream_ratio)
            .field("concurrency_level", &self.concurrency_level)
            .field("hot_max", &self.hot_max)
            .field(
                "index_event_listener",
                &self.index_event_listener.as_ref().map(|_| "<listener>"),
            )
            .finish()
    }
}
