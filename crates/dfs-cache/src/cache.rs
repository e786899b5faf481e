//! The shared block cache.
//!
//! A fixed-size hash table of immutable, singly-linked chains. Readers scan
//! a chain without locking; writers publish a new chain head with a
//! compare-and-swap, dropping evicted entries as they go. Loads of the same
//! `(key, position)` are serialized through a striped lock so each block is
//! read at most once.
//!
//! Residency is controlled by a clock ring. Every entry that holds bytes
//! sits in the ring; each access raises its hotness up to a per-extension
//! cap, and the eviction hand cools hot entries and evicts cold ones until
//! the live byte total fits the budget.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use arc_swap::{ArcSwap, ArcSwapOption};
use dfs_types::PackExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, trace};

use crate::block::Block;
use crate::channel::ChannelSupplier;
use crate::config::BlockCacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::events::{IndexEventListener, IndexEvicted, IndexRequested};
use crate::file::BlockBasedFile;
use crate::stream_key::StreamKey;

/// Position used for whole-file typed references (parsed indexes).
pub const REF_POSITION: u64 = 0;

type AnyValue = Arc<dyn Any + Send + Sync>;

static INSTANCE: LazyLock<ArcSwap<BlockCache>> =
    LazyLock::new(|| ArcSwap::from_pointee(BlockCache::build(BlockCacheConfig::default())));

/// One cached value and its residency state.
struct CacheEntry {
    key: StreamKey,
    position: u64,
    size: usize,
    value: RwLock<Option<AnyValue>>,
    hot: AtomicU8,
    hot_max: u8,
    hits: AtomicU64,
}

impl CacheEntry {
    fn new(key: StreamKey, position: u64, size: usize, value: AnyValue, hot_max: u8) -> Self {
        Self {
            key,
            position,
            size,
            value: RwLock::new(Some(value)),
            hot: AtomicU8::new(0),
            hot_max,
            hits: AtomicU64::new(0),
        }
    }

    fn get(&self) -> Option<AnyValue> {
        let value = self.value.read().clone();
        if value.is_some() {
            self.mark_hotter();
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    fn is_live(&self) -> bool {
        self.value.read().is_some()
    }

    fn mark_hotter(&self) {
        let cap = self.hot_max;
        let _ = self
            .hot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |h| {
                Some(h.saturating_add(1).min(cap))
            });
    }

    fn mark_colder(&self) {
        let _ = self
            .hot
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |h| {
                Some(h.saturating_sub(1))
            });
    }

    fn is_hot(&self) -> bool {
        self.hot.load(Ordering::Acquire) > 0
    }

    fn clear(&self) {
        *self.value.write() = None;
    }
}

/// Immutable chain node; a new head is published for every insertion.
struct HashEntry {
    entry: Arc<CacheEntry>,
    next: Option<Arc<HashEntry>>,
}

type Chain = Option<Arc<HashEntry>>;

fn same_chain(a: &Chain, b: &Chain) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}

/// Copy of `top` without evicted entries, sharing the untouched tail.
fn clean(top: Option<&Arc<HashEntry>>) -> Chain {
    let mut top = top;
    while let Some(node) = top {
        if node.entry.is_live() {
            break;
        }
        top = node.next.as_ref();
    }
    let node = top?;
    let next = clean(node.next.as_ref());
    if same_chain(&next, &node.next) {
        Some(Arc::clone(node))
    } else {
        Some(Arc::new(HashEntry {
            entry: Arc::clone(&node.entry),
            next,
        }))
    }
}

/// Handle on a cached typed value.
///
/// The value stays reachable through the handle even after the cache
/// evicts it.
pub struct CacheRef<T> {
    entry: Arc<CacheEntry>,
    value: Arc<T>,
}

impl<T> CacheRef<T> {
    /// The value, resident or not.
    pub fn get(&self) -> &Arc<T> {
        &self.value
    }

    /// Give up the handle, keeping the value.
    pub fn into_value(self) -> Arc<T> {
        self.value
    }

    /// Stream the value was cached under.
    pub fn key(&self) -> &StreamKey {
        &self.entry.key
    }

    /// Position the value was cached at; [`REF_POSITION`] for whole-file values.
    pub fn position(&self) -> u64 {
        self.entry.position
    }

    /// Bytes charged against the cache budget.
    pub fn size(&self) -> usize {
        self.entry.size
    }

    /// The value if the entry is still resident. Does not count as a use.
    pub fn live(&self) -> Option<Arc<T>> {
        self.entry.is_live().then(|| Arc::clone(&self.value))
    }

    /// The value if the entry is still resident, marking it recently used.
    pub fn access(&self) -> Option<Arc<T>> {
        self.entry.get().map(|_| Arc::clone(&self.value))
    }

    /// False once the cache has evicted the entry.
    pub fn is_resident(&self) -> bool {
        self.entry.is_live()
    }

    /// Accesses served by this entry since it was cached.
    pub fn hit_count(&self) -> u64 {
        self.entry.hits.load(Ordering::Relaxed)
    }
}

impl<T> Clone for CacheRef<T> {
    fn clone(&self) -> Self {
        Self {
            entry: Arc::clone(&self.entry),
            value: Arc::clone(&self.value),
        }
    }
}

impl<T> fmt::Debug for CacheRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheRef")
            .field("key", &self.entry.key)
            .field("position", &self.entry.position)
            .field("size", &self.entry.size)
            .finish()
    }
}

/// Point-in-time counters, indexed by [`PackExt::position`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub live_bytes: [i64; PackExt::COUNT],
    pub hits: [u64; PackExt::COUNT],
    pub misses: [u64; PackExt::COUNT],
    pub evictions: [u64; PackExt::COUNT],
}

impl CacheStats {
    pub fn total_live_bytes(&self) -> i64 {
        self.live_bytes.iter().sum()
    }

    pub fn total_hits(&self) -> u64 {
        self.hits.iter().sum()
    }

    pub fn total_misses(&self) -> u64 {
        self.misses.iter().sum()
    }

    pub fn total_evictions(&self) -> u64 {
        self.evictions.iter().sum()
    }

    /// Hits as a percentage of requests for `ext`; 0 with no requests.
    pub fn hit_ratio(&self, ext: PackExt) -> u64 {
        let p = ext.position();
        let total = self.hits[p] + self.misses[p];
        if total == 0 {
            0
        } else {
            self.hits[p] * 100 / total
        }
    }
}

#[derive(Default)]
struct Counters {
    live_bytes: [AtomicI64; PackExt::COUNT],
    hits: [AtomicU64; PackExt::COUNT],
    misses: [AtomicU64; PackExt::COUNT],
    evictions: [AtomicU64; PackExt::COUNT],
    /// Micros since cache creation of the last eviction, plus one; 0 = never.
    last_eviction: [AtomicU64; PackExt::COUNT],
}

/// Process-wide cache of file blocks and parsed index structures.
pub struct BlockCache {
    max_bytes: i64,
    block_size: u32,
    block_size_shift: u32,
    max_stream_through_cache: u64,
    hot_caps: [u8; PackExt::COUNT],
    max_hot: u8,
    table: Box<[ArcSwapOption<HashEntry>]>,
    load_locks: Box<[Mutex<()>]>,
    ref_locks: Box<[Mutex<()>]>,
    /// Front is the next entry the hand visits; back is the newest.
    clock: Mutex<VecDeque<Arc<CacheEntry>>>,
    counters: Counters,
    listener: Option<Arc<dyn IndexEventListener>>,
    created: Instant,
}

impl BlockCache {
    /// Build a cache after validating `config`.
    pub fn new(config: BlockCacheConfig) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: BlockCacheConfig) -> Self {
        let table_size = config.table_size();
        let concurrency = config.concurrency_level.max(1);
        let hot_caps = config.hot_caps();
        debug!(
            block_limit = config.block_limit,
            block_size = config.block_size,
            table_size,
            concurrency,
            "creating block cache"
        );
        Self {
            max_bytes: i64::try_from(config.block_limit).unwrap_or(i64::MAX),
            block_size: config.block_size,
            block_size_shift: config.block_size.trailing_zeros(),
            max_stream_through_cache: (config.block_limit as f64 * config.stream_ratio) as u64,
            max_hot: hot_caps.iter().copied().max().unwrap_or(0),
            hot_caps,
            table: (0..table_size).map(|_| ArcSwapOption::empty()).collect(),
            load_locks: (0..concurrency).map(|_| Mutex::new(())).collect(),
            ref_locks: (0..concurrency).map(|_| Mutex::new(())).collect(),
            clock: Mutex::new(VecDeque::new()),
            counters: Counters::default(),
            listener: config.index_event_listener,
            created: Instant::now(),
        }
    }

    /// The process-wide cache.
    pub fn instance() -> Arc<BlockCache> {
        INSTANCE.load_full()
    }

    /// Replace the process-wide cache. Existing holders keep the old one.
    pub fn reconfigure(config: BlockCacheConfig) -> CacheResult<Arc<BlockCache>> {
        let cache = Arc::new(Self::new(config)?);
        INSTANCE.store(Arc::clone(&cache));
        debug!(block_size = cache.block_size, "block cache reconfigured");
        Ok(cache)
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Live byte budget.
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes as u64
    }

    /// Whether a file of `length` bytes should be copied via cached blocks
    /// rather than read directly.
    pub fn should_copy_through_cache(&self, length: u64) -> bool {
        length <= self.max_stream_through_cache
    }

    /// Hotness cap applied to entries of `ext`.
    pub fn hot_cap(&self, ext: PackExt) -> u8 {
        self.hot_caps[ext.position()]
    }

    /// Bytes currently charged against the budget.
    pub fn total_live_bytes(&self) -> i64 {
        self.counters
            .live_bytes
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum()
    }

    /// Live bytes as a percentage of the budget.
    pub fn fill_percentage(&self) -> u64 {
        (self.total_live_bytes().max(0) as u64) * 100 / self.max_bytes.max(1) as u64
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            live_bytes: std::array::from_fn(|i| c.live_bytes[i].load(Ordering::Relaxed)),
            hits: std::array::from_fn(|i| c.hits[i].load(Ordering::Relaxed)),
            misses: std::array::from_fn(|i| c.misses[i].load(Ordering::Relaxed)),
            evictions: std::array::from_fn(|i| c.evictions[i].load(Ordering::Relaxed)),
        }
    }

    // --- block access -------------------------------------------------------

    /// Return the block of `file` holding byte `position`, reading it through
    /// `channels` on a miss.
    ///
    /// Concurrent callers for the same block wait for a single load and all
    /// receive the same block.
    pub fn get_or_load(
        &self,
        file: &BlockBasedFile,
        position: u64,
        channels: &mut dyn ChannelSupplier,
    ) -> CacheResult<Arc<Block>> {
        let block = self.get_or_load_aligned(file, position, channels)?;
        if block.contains(file.key(), position) {
            return Ok(block);
        }
        // The file's block size was discovered by this load; realign once.
        let block = self.get_or_load_aligned(file, position, channels)?;
        if block.contains(file.key(), position) {
            Ok(block)
        } else {
            Err(file.short_read(position, 1, 0))
        }
    }

    fn get_or_load_aligned(
        &self,
        file: &BlockBasedFile,
        requested: u64,
        channels: &mut dyn ChannelSupplier,
    ) -> CacheResult<Arc<Block>> {
        let key = file.key();
        let position = file.align_to_block(requested);
        let slot = self.slot(key, position);
        let e1 = self.table[slot].load_full();
        if let Some((_, block)) = self.scan_typed::<Block>(&e1, key, position) {
            if block.contains(key, requested) {
                self.record_hit(key);
                return Ok(block);
            }
        }

        self.reserve_space(self.block_size as usize, key);
        let _guard = self.load_locks[self.lock_index(key, position)].lock();
        let e2 = self.table[slot].load_full();
        if !same_chain(&e1, &e2) {
            if let Some((_, block)) = self.scan_typed::<Block>(&e2, key, position) {
                self.credit_space(self.block_size as usize, key);
                self.record_hit(key);
                return Ok(block);
            }
        }

        self.record_miss(key);
        let loaded = channels
            .channel()
            .map_err(CacheError::from)
            .and_then(|rc| file.read_one_block(position, rc));
        let block = match loaded {
            Ok(block) => Arc::new(block),
            Err(e) => {
                self.credit_space(self.block_size as usize, key);
                return Err(e);
            }
        };
        trace!(file = file.file_name(), position = block.start(), size = block.size(), "loaded block");

        if block.start() != position {
            let moved = self.slot(key, block.start());
            let head = self.table[moved].load_full();
            if let Some((_, existing)) = self.scan_typed::<Block>(&head, key, block.start()) {
                self.credit_space(self.block_size as usize, key);
                return Ok(existing);
            }
            // Not under the moved slot's load lock: a racing load there at
            // worst publishes a duplicate, and insert's rcu keeps the chain
            // consistent while clean() drops it once evicted.
            return Ok(self.publish_block(moved, block));
        }
        Ok(self.publish_block(slot, block))
    }

    fn publish_block(&self, slot: usize, block: Arc<Block>) -> Arc<Block> {
        let key = block.key();
        let value: AnyValue = Arc::clone(&block) as AnyValue;
        let entry = Arc::new(CacheEntry::new(
            key.clone(),
            block.start(),
            block.size(),
            value,
            self.hot_cap(key.ext()),
        ));
        entry.mark_hotter();
        self.insert(slot, &entry);
        self.add_to_clock(entry, self.block_size as i64 - block.size() as i64);
        block
    }

    // --- typed references ---------------------------------------------------

    /// Return the value cached at `(key, position)`, running `loader` on a
    /// miss. The loader yields the value and its size in bytes.
    ///
    /// Loads for the same key are serialized; the loader runs at most once
    /// per residency.
    pub fn get_or_load_ref<T, E, F>(
        &self,
        key: &StreamKey,
        position: u64,
        loader: F,
    ) -> Result<CacheRef<T>, E>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<(T, usize), E>,
    {
        let started = Instant::now();
        let slot = self.slot(key, position);
        let e1 = self.table[slot].load_full();
        if let Some(r) = self.scan_ref::<T>(&e1, key, position) {
            self.record_hit(key);
            self.report_index_requested(key, true, 0, r.size());
            return Ok(r);
        }

        let _guard = self.ref_locks[self.ref_lock_index(key)].lock();
        let e2 = self.table[slot].load_full();
        if !same_chain(&e1, &e2) {
            if let Some(r) = self.scan_ref::<T>(&e2, key, position) {
                self.record_hit(key);
                self.report_index_requested(key, true, 0, r.size());
                return Ok(r);
            }
        }

        self.record_miss(key);
        let (value, size) = loader()?;
        self.reserve_space(size, key);
        let r = self.publish_ref(slot, key, position, size, value);
        self.report_index_requested(key, false, started.elapsed().as_micros() as u64, size);
        Ok(r)
    }

    /// Publish a precomputed value at `(key, position)`. If a value is
    /// already cached there, it is returned and `value` is dropped.
    pub fn put<T>(&self, key: &StreamKey, position: u64, size: usize, value: T) -> CacheRef<T>
    where
        T: Any + Send + Sync,
    {
        let lock = &self.load_locks[self.lock_index(key, position)];
        self.put_locked(lock, key, position, size, value)
    }

    /// Publish a precomputed whole-file value for `key`.
    pub fn put_ref<T>(&self, key: &StreamKey, size: usize, value: T) -> CacheRef<T>
    where
        T: Any + Send + Sync,
    {
        let lock = &self.ref_locks[self.ref_lock_index(key)];
        self.put_locked(lock, key, REF_POSITION, size, value)
    }

    fn put_locked<T>(
        &self,
        lock: &Mutex<()>,
        key: &StreamKey,
        position: u64,
        size: usize,
        value: T,
    ) -> CacheRef<T>
    where
        T: Any + Send + Sync,
    {
        let slot = self.slot(key, position);
        let e1 = self.table[slot].load_full();
        if let Some(r) = self.scan_ref::<T>(&e1, key, position) {
            return r;
        }

        self.reserve_space(size, key);
        let _guard = lock.lock();
        let e2 = self.table[slot].load_full();
        if !same_chain(&e1, &e2) {
            if let Some(r) = self.scan_ref::<T>(&e2, key, position) {
                self.credit_space(size, key);
                return r;
            }
        }
        self.publish_ref(slot, key, position, size, value)
    }

    fn publish_ref<T>(
        &self,
        slot: usize,
        key: &StreamKey,
        position: u64,
        size: usize,
        value: T,
    ) -> CacheRef<T>
    where
        T: Any + Send + Sync,
    {
        let value = Arc::new(value);
        let any: AnyValue = Arc::clone(&value) as AnyValue;
        let entry = Arc::new(CacheEntry::new(
            key.clone(),
            position,
            size,
            any,
            self.hot_cap(key.ext()),
        ));
        entry.mark_hotter();
        self.insert(slot, &entry);
        self.add_to_clock(Arc::clone(&entry), 0);
        CacheRef { entry, value }
    }

    /// Look up a cached value without loading.
    pub fn get<T>(&self, key: &StreamKey, position: u64) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let head = self.table[self.slot(key, position)].load_full();
        match self.scan_typed::<T>(&head, key, position) {
            Some((_, value)) => {
                self.record_hit(key);
                Some(value)
            }
            None => {
                self.record_miss(key);
                None
            }
        }
    }

    /// True if a live value is cached at `(key, position)`. Does not
    /// count as a use of the entry.
    pub fn contains(&self, key: &StreamKey, position: u64) -> bool {
        let head = self.table[self.slot(key, position)].load_full();
        let mut node = head.as_ref();
        while let Some(n) = node {
            let e = &n.entry;
            if e.position == position && e.key == *key && e.is_live() {
                return true;
            }
            node = n.next.as_ref();
        }
        false
    }

    // --- table --------------------------------------------------------------

    fn hash(&self, key: &StreamKey, position: u64) -> u64 {
        u64::from(key.hash_code()).wrapping_add(position >> self.block_size_shift)
    }

    fn slot(&self, key: &StreamKey, position: u64) -> usize {
        ((self.hash(key, position) >> 1) % self.table.len() as u64) as usize
    }

    fn lock_index(&self, key: &StreamKey, position: u64) -> usize {
        ((self.hash(key, position) >> 1) % self.load_locks.len() as u64) as usize
    }

    fn ref_lock_index(&self, key: &StreamKey) -> usize {
        ((u64::from(key.hash_code()) >> 1) % self.ref_locks.len() as u64) as usize
    }

    fn scan_entry(
        &self,
        head: &Chain,
        key: &StreamKey,
        position: u64,
    ) -> Option<(Arc<CacheEntry>, AnyValue)> {
        let mut node = head.as_ref();
        while let Some(n) = node {
            let e = &n.entry;
            if e.position == position && e.key == *key {
                if let Some(value) = e.get() {
                    return Some((Arc::clone(e), value));
                }
            }
            node = n.next.as_ref();
        }
        None
    }

    fn scan_typed<T>(
        &self,
        head: &Chain,
        key: &StreamKey,
        position: u64,
    ) -> Option<(Arc<CacheEntry>, Arc<T>)>
    where
        T: Any + Send + Sync,
    {
        let (entry, value) = self.scan_entry(head, key, position)?;
        value.downcast::<T>().ok().map(|v| (entry, v))
    }

    fn scan_ref<T>(&self, head: &Chain, key: &StreamKey, position: u64) -> Option<CacheRef<T>>
    where
        T: Any + Send + Sync,
    {
        self.scan_typed::<T>(head, key, position)
            .map(|(entry, value)| CacheRef { entry, value })
    }

    fn insert(&self, slot: usize, entry: &Arc<CacheEntry>) {
        self.table[slot].rcu(|head| {
            Some(Arc::new(HashEntry {
                entry: Arc::clone(entry),
                next: clean(head.as_ref()),
            }))
        });
    }

    // --- clock --------------------------------------------------------------

    fn reserve_space(&self, reserve: usize, key: &StreamKey) {
        let mut clock = self.clock.lock();
        let mut live = self.total_live_bytes() + reserve as i64;
        if live > self.max_bytes {
            let max_visits = clock.len() * (usize::from(self.max_hot) + 1);
            let mut visits = 0;
            while live > self.max_bytes && visits < max_visits {
                let Some(hand) = clock.pop_front() else {
                    break;
                };
                visits += 1;
                if hand.is_hot() {
                    hand.mark_colder();
                    clock.push_back(hand);
                    continue;
                }
                live -= hand.size as i64;
                self.evict(&hand);
            }
        }
        self.counters.live_bytes[key.ext_position()].fetch_add(reserve as i64, Ordering::Relaxed);
    }

    fn credit_space(&self, credit: usize, key: &StreamKey) {
        let _clock = self.clock.lock();
        self.counters.live_bytes[key.ext_position()].fetch_sub(credit as i64, Ordering::Relaxed);
    }

    fn add_to_clock(&self, entry: Arc<CacheEntry>, credit: i64) {
        let mut clock = self.clock.lock();
        if credit != 0 {
            self.counters.live_bytes[entry.key.ext_position()].fetch_sub(credit, Ordering::Relaxed);
        }
        clock.push_back(entry);
    }

    /// Called with the clock lock held.
    fn evict(&self, entry: &CacheEntry) {
        let p = entry.key.ext_position();
        entry.clear();
        self.counters.live_bytes[p].fetch_sub(entry.size as i64, Ordering::Relaxed);
        self.counters.evictions[p].fetch_add(1, Ordering::Relaxed);
        let since_last = self.micros_since_last_eviction(p);
        self.counters.last_eviction[p].store(self.now_micros() + 1, Ordering::Relaxed);
        trace!(key = ?entry.key, position = entry.position, size = entry.size, "evicted");

        if let Some(listener) = &self.listener {
            if entry.key.ext().is_index() && listener.is_evict_listener_enabled() {
                listener.on_index_evicted(&IndexEvicted {
                    ext: entry.key.ext(),
                    size: entry.size,
                    total_hits: entry.hits.load(Ordering::Relaxed),
                    micros_since_last_eviction: since_last,
                });
            }
        }
    }

    // --- statistics ---------------------------------------------------------

    fn record_hit(&self, key: &StreamKey) {
        self.counters.hits[key.ext_position()].fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self, key: &StreamKey) {
        self.counters.misses[key.ext_position()].fetch_add(1, Ordering::Relaxed);
    }

    fn now_micros(&self) -> u64 {
        self.created.elapsed().as_micros() as u64
    }

    fn micros_since_last_eviction(&self, p: usize) -> Option<u64> {
        match self.counters.last_eviction[p].load(Ordering::Relaxed) {
            0 => None,
            stamp => Some(self.now_micros().saturating_sub(stamp - 1)),
        }
    }

    fn report_index_requested(&self, key: &StreamKey, cache_hit: bool, load_micros: u64, size: usize) {
        let Some(listener) = &self.listener else {
            return;
        };
        let ext = key.ext();
        if !ext.is_index() {
            return;
        }
        listener.on_index_requested(&IndexRequested {
            ext,
            cache_hit,
            load_micros,
            size,
            micros_since_last_eviction: self.micros_since_last_eviction(ext.position()),
        });
    }
}

impl fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockCache")
            .field("max_bytes", &self.max_bytes)
            .field("block_size", &self.block_size)
            .field("table_size", &self.table.len())
            .field("live_bytes", &self.total_live_bytes())
            .finish()
    }
}
