use dfs_types::ObjectId;

use crate::error::{PackError, PackResult};
use crate::index::PackIndex;

/// Estimated in-memory bytes per object of a reverse index.
pub const REVERSE_INDEX_BYTES_PER_OBJECT: usize = 8;

/// Offset-ordered view of a pack index: which object lives at an offset,
/// and where the next entry starts.
#[derive(Clone, Debug)]
pub struct ReverseIndex {
    /// `(offset, id)` sorted by offset; this is pack order.
    entries: Vec<(u64, ObjectId)>,
}

impl ReverseIndex {
    pub fn new(index: &PackIndex) -> Self {
        let mut entries: Vec<_> = index.entries().map(|e| (e.offset, e.id)).collect();
        entries.sort_unstable_by_key(|&(offset, _)| offset);
        Self { entries }
    }

    pub fn object_count(&self) -> usize {
        self.entries.len()
    }

    /// Id of the object whose entry starts at `offset`.
    pub fn find_object(&self, offset: u64) -> Option<ObjectId> {
        self.pack_position(offset).map(|n| self.entries[n].1)
    }

    /// Position of the entry at `offset` in pack order.
    pub fn pack_position(&self, offset: u64) -> Option<usize> {
        self.entries
            .binary_search_by_key(&offset, |&(o, _)| o)
            .ok()
    }

    /// Id of the `n`th object in pack order.
    pub fn object_at(&self, n: usize) -> Option<ObjectId> {
        self.entries.get(n).map(|&(_, id)| id)
    }

    /// Offset where the entry after the one at `offset` begins, or
    /// `max_offset` for the last entry.
    pub fn find_next_offset(&self, offset: u64, max_offset: u64) -> PackResult<u64> {
        let n = self.pack_position(offset).ok_or_else(|| {
            PackError::Index(format!("no object starts at offset {offset}"))
        })?;
        Ok(self
            .entries
            .get(n + 1)
            .map_or(max_offset, |&(next, _)| next))
    }
}
