use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dfs_pack::PackFile;
use dfs_types::PackDescription;

use crate::reftable::ReftableFile;

/// An immutable view of the packs and reftables that exist at one point.
///
/// A new list replaces the old one whole; the arrays are never edited in
/// place. The dirty flag asks the next reader to rescan storage.
#[derive(Debug)]
pub struct PackList {
    packs: Vec<Arc<PackFile>>,
    reftables: Vec<Arc<ReftableFile>>,
    dirty: AtomicBool,
    sentinel: bool,
}

impl PackList {
    pub(crate) fn new(packs: Vec<Arc<PackFile>>, reftables: Vec<Arc<ReftableFile>>) -> Self {
        Self {
            packs,
            reftables,
            dirty: AtomicBool::new(false),
            sentinel: false,
        }
    }

    /// The placeholder used before the first scan. Always dirty.
    pub(crate) fn no_packs() -> Self {
        Self {
            sentinel: true,
            ..Self::new(Vec::new(), Vec::new())
        }
    }

    /// Packs in lookup order.
    pub fn packs(&self) -> &[Arc<PackFile>] {
        &self.packs
    }

    /// Reftables in stacking order.
    pub fn reftables(&self) -> &[Arc<ReftableFile>] {
        &self.reftables
    }

    pub fn is_empty(&self) -> bool {
        self.packs.is_empty() && self.reftables.is_empty()
    }

    pub(crate) fn is_sentinel(&self) -> bool {
        self.sentinel
    }

    /// True if storage may have changed since this list was built.
    pub fn is_dirty(&self) -> bool {
        self.sentinel || self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn find_pack(&self, desc: &PackDescription) -> Option<&Arc<PackFile>> {
        self.packs.iter().find(|p| p.desc().as_ref() == desc)
    }

    pub fn find_reftable(&self, desc: &PackDescription) -> Option<&Arc<ReftableFile>> {
        self.reftables.iter().find(|r| r.desc().as_ref() == desc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_stays_dirty() {
        let list = PackList::no_packs();
        list.clear_dirty();
        assert!(list.is_dirty());
        assert!(list.is_empty());
    }

    #[test]
    fn dirty_flag_round_trip() {
        let list = PackList::new(Vec::new(), Vec::new());
        assert!(!list.is_dirty());
        list.mark_dirty();
        assert!(list.is_dirty());
        list.clear_dirty();
        assert!(!list.is_dirty());
    }
}
