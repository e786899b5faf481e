use bytes::Bytes;
use dfs_cache::StreamKey;
use dfs_types::ObjectType;
use hashlink::LruCache;

type BaseKey = (StreamKey, u64);

/// Per-reader LRU of inflated delta bases, bounded by total bytes.
///
/// Keyed by pack file and entry offset. Objects larger than the whole
/// budget are never stored.
pub struct DeltaBaseCache {
    entries: LruCache<BaseKey, (ObjectType, Bytes)>,
    limit: usize,
    used: usize,
}

impl DeltaBaseCache {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: LruCache::new_unbounded(),
            limit,
            used: 0,
        }
    }

    pub fn get(&mut self, key: &StreamKey, offset: u64) -> Option<(ObjectType, Bytes)> {
        self.entries.get(&(key.clone(), offset)).cloned()
    }

    pub fn put(&mut self, key: &StreamKey, offset: u64, object_type: ObjectType, data: Bytes) {
        if data.len() > self.limit {
            return;
        }
        let size = data.len();
        if let Some((_, old)) = self.entries.insert((key.clone(), offset), (object_type, data)) {
            self.used -= old.len();
        }
        self.used += size;
        while self.used > self.limit {
            match self.entries.remove_lru() {
                Some((_, (_, evicted))) => self.used -= evicted.len(),
                None => break,
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.used = 0;
    }

    /// Bytes currently held.
    pub fn used(&self) -> usize {
        self.used
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for DeltaBaseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaBaseCache")
            .field("entries", &self.entries.len())
            .field("used", &self.used)
            .field("limit", &self.limit)
            .finish()
    }
}
