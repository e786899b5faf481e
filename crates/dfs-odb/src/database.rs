//! The object database: which packs exist, and readers over them.
//!
//! The current [`PackList`] is held in an [`ArcSwap`]; readers load it
//! without locking. Rescans are serialized per database and publish their
//! result with a compare-and-swap, so a scan that loses a race hands back
//! the winner's list instead of overwriting it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;

use arc_swap::ArcSwap;
use dfs_cache::{BlockCache, FileOpener};
use dfs_pack::{PackFile, PackWriter, ReaderOptions, WrittenPack};
use dfs_types::{PackDescription, PackExt, PackSource, RepositoryDescription};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::OdbResult;
use crate::pack_list::PackList;
use crate::reader::Reader;
use crate::reftable::ReftableFile;
use crate::storage::DfsStorage;

/// Orders packs for object lookup; earlier packs are searched first.
pub type PackOrder = fn(&PackDescription, &PackDescription) -> Ordering;

/// Notified after the set of packs changes.
pub trait PacksChangedListener: Send + Sync {
    fn on_packs_changed(&self, repository: &RepositoryDescription);
}

/// Pack-list manager for one repository.
pub struct ObjectDatabase {
    storage: Arc<dyn DfsStorage>,
    opener: Arc<dyn FileOpener>,
    cache: Arc<BlockCache>,
    options: ReaderOptions,
    order: PackOrder,
    pack_list: ArcSwap<PackList>,
    scan_lock: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn PacksChangedListener>>>,
}

impl ObjectDatabase {
    pub fn new<S: DfsStorage + 'static>(storage: Arc<S>, cache: Arc<BlockCache>) -> Self {
        Self {
            opener: Arc::clone(&storage) as Arc<dyn FileOpener>,
            storage,
            cache,
            options: ReaderOptions::default(),
            order: PackDescription::object_lookup_order,
            pack_list: ArcSwap::from_pointee(PackList::no_packs()),
            scan_lock: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Options handed to every new reader.
    pub fn with_options(mut self, options: ReaderOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the lookup order used when packs are scanned.
    pub fn with_pack_order(mut self, order: PackOrder) -> Self {
        self.order = order;
        self
    }

    pub fn repository(&self) -> &RepositoryDescription {
        self.storage.repository()
    }

    pub fn storage(&self) -> &Arc<dyn DfsStorage> {
        &self.storage
    }

    pub fn opener(&self) -> &Arc<dyn FileOpener> {
        &self.opener
    }

    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    pub fn options(&self) -> &ReaderOptions {
        &self.options
    }

    pub fn add_packs_changed_listener(&self, listener: Arc<dyn PacksChangedListener>) {
        self.listeners.write().push(listener);
    }

    /// A reader with its own context over this database.
    pub fn new_reader(self: &Arc<Self>) -> Reader {
        Reader::new(self)
    }

    // --- pack list ----------------------------------------------------------

    /// The current pack list, rescanning storage first if it is dirty.
    pub fn pack_list(&self) -> OdbResult<Arc<PackList>> {
        let current = self.pack_list.load_full();
        if current.is_dirty() {
            self.scan_packs(&current)
        } else {
            Ok(current)
        }
    }

    /// The current pack list as is, without scanning.
    pub fn current_pack_list(&self) -> Arc<PackList> {
        self.pack_list.load_full()
    }

    pub fn packs(&self) -> OdbResult<Vec<Arc<PackFile>>> {
        Ok(self.pack_list()?.packs().to_vec())
    }

    pub fn reftables(&self) -> OdbResult<Vec<Arc<ReftableFile>>> {
        Ok(self.pack_list()?.reftables().to_vec())
    }

    /// Forget every pack wrapper; the next access rescans.
    pub fn clear_cache(&self) {
        self.pack_list.store(Arc::new(PackList::no_packs()));
    }

    /// Rescan storage and publish the result, unless `original` is no
    /// longer current, in which case the current list is returned as is.
    pub fn scan_packs(&self, original: &Arc<PackList>) -> OdbResult<Arc<PackList>> {
        let _guard = self.scan_lock.lock();
        let old = self.pack_list.load_full();
        if !Arc::ptr_eq(&old, original) {
            return Ok(old);
        }

        let Some(next) = self.scan_impl(&old)? else {
            old.clear_dirty();
            return Ok(old);
        };
        let next = Arc::new(next);
        let prev = self.pack_list.compare_and_swap(&old, Arc::clone(&next));
        if !Arc::ptr_eq(&*prev, &old) {
            return Ok(self.pack_list.load_full());
        }

        debug!(
            repository = %self.repository(),
            packs = next.packs().len(),
            reftables = next.reftables().len(),
            "published pack list"
        );
        self.fire_packs_changed();
        Ok(next)
    }

    /// Build a list from storage, reusing wrappers from `old`. `None` means
    /// nothing was added or removed.
    fn scan_impl(&self, old: &PackList) -> OdbResult<Option<PackList>> {
        let mut old_packs: HashMap<String, Arc<PackFile>> = old
            .packs()
            .iter()
            .map(|p| (p.desc().pack_name.clone(), Arc::clone(p)))
            .collect();
        let mut old_tables: HashMap<String, Arc<ReftableFile>> = old
            .reftables()
            .iter()
            .map(|r| (r.desc().pack_name.clone(), Arc::clone(r)))
            .collect();

        let mut packs = Vec::new();
        let mut reftables = Vec::new();
        let mut found_new = false;
        for desc in self.storage.list_packs()? {
            let desc = Arc::new(desc);
            if desc.has_file_ext(PackExt::Pack) {
                match old_packs.remove(&desc.pack_name) {
                    Some(pack) if !pack.is_invalid() => packs.push(pack),
                    stale => {
                        if stale.is_some() {
                            warn!(pack = %desc.pack_name, "dropping invalid pack wrapper");
                        }
                        packs.push(Arc::new(PackFile::new(Arc::clone(&self.cache), Arc::clone(&desc))));
                        found_new = true;
                    }
                }
            }
            if desc.has_file_ext(PackExt::Reftable) {
                match old_tables.remove(&desc.pack_name) {
                    Some(table) if !table.is_invalid() => reftables.push(table),
                    stale => {
                        if stale.is_some() {
                            warn!(reftable = %desc.pack_name, "dropping invalid reftable wrapper");
                        }
                        reftables.push(Arc::new(ReftableFile::new(Arc::clone(&self.cache), desc)));
                        found_new = true;
                    }
                }
            }
        }

        if !found_new && old_packs.is_empty() && old_tables.is_empty() && !old.is_sentinel() {
            return Ok(None);
        }

        let order = self.order;
        packs.sort_by(|a, b| order(a.desc(), b.desc()));
        reftables.sort_by(|a, b| PackDescription::reftable_order(a.desc(), b.desc()));
        debug!(
            repository = %self.repository(),
            packs = packs.len(),
            removed = old_packs.len() + old_tables.len(),
            "scanned packs"
        );
        Ok(Some(PackList::new(packs, reftables)))
    }

    // --- changes ------------------------------------------------------------

    /// Splice a newly committed pack into the current list, ahead of the
    /// others, without touching their wrappers.
    pub fn add_pack(&self, desc: PackDescription) -> OdbResult<Arc<PackFile>> {
        let desc = Arc::new(desc);
        let mut wrapper = None;
        loop {
            let mut old = self.pack_list.load_full();
            if old.is_sentinel() {
                old = self.scan_packs(&old)?;
                if let Some(existing) = old.find_pack(&desc) {
                    return Ok(Arc::clone(existing));
                }
            }

            let pack = Arc::clone(
                wrapper.get_or_insert_with(|| Arc::new(PackFile::new(Arc::clone(&self.cache), Arc::clone(&desc)))),
            );
            let mut packs = Vec::with_capacity(old.packs().len() + 1);
            packs.push(Arc::clone(&pack));
            packs.extend(old.packs().iter().filter(|p| *p.desc() != desc).cloned());
            let next = Arc::new(PackList::new(packs, old.reftables().to_vec()));

            let prev = self.pack_list.compare_and_swap(&old, next);
            if Arc::ptr_eq(&*prev, &old) {
                debug!(pack = %desc.pack_name, "added pack");
                return Ok(pack);
            }
        }
    }

    /// Splice in reftable `add`, dropping the reftables in `remove`.
    pub fn add_reftable(&self, add: PackDescription, remove: &[PackDescription]) -> OdbResult<Arc<ReftableFile>> {
        let desc = Arc::new(add);
        let table = Arc::new(ReftableFile::new(Arc::clone(&self.cache), Arc::clone(&desc)));
        loop {
            let mut old = self.pack_list.load_full();
            if old.is_sentinel() {
                old = self.scan_packs(&old)?;
            }

            let mut reftables: Vec<_> = old
                .reftables()
                .iter()
                .filter(|r| *r.desc() != desc && !remove.contains(r.desc()))
                .cloned()
                .collect();
            reftables.push(Arc::clone(&table));
            reftables.sort_by(|a, b| PackDescription::reftable_order(a.desc(), b.desc()));
            let next = Arc::new(PackList::new(old.packs().to_vec(), reftables));

            let prev = self.pack_list.compare_and_swap(&old, next);
            if Arc::ptr_eq(&*prev, &old) {
                debug!(reftable = %desc.pack_name, removed = remove.len(), "added reftable");
                return Ok(table);
            }
        }
    }

    /// Persist `added` and retire `replaced`, then mark the list dirty.
    pub fn commit_pack(&self, added: &[PackDescription], replaced: &[PackDescription]) -> OdbResult<()> {
        self.storage.commit_pack(added, replaced)?;
        self.current_pack_list().mark_dirty();
        debug!(added = added.len(), replaced = replaced.len(), "committed packs");
        self.fire_packs_changed();
        Ok(())
    }

    pub fn rollback_pack(&self, descs: &[PackDescription]) -> OdbResult<()> {
        self.storage.rollback_pack(descs)
    }

    /// Encode `writer` into a new pack, store it, commit it and add it.
    pub fn write_pack(&self, source: PackSource, writer: PackWriter) -> OdbResult<Arc<PackFile>> {
        let written = writer.finish()?;
        self.store_pack(source, &written)
    }

    /// Store already encoded pack and index bytes as a new pack.
    pub fn store_pack(&self, source: PackSource, written: &WrittenPack) -> OdbResult<Arc<PackFile>> {
        let mut desc = self.storage.new_pack(source)?;
        written.describe(&mut desc);
        if let Err(err) = self.write_files(&mut desc, written) {
            if let Err(rollback) = self.storage.rollback_pack(std::slice::from_ref(&desc)) {
                warn!(pack = %desc.pack_name, error = %rollback, "rollback failed");
            }
            return Err(err);
        }
        self.commit_pack(std::slice::from_ref(&desc), &[])?;
        self.add_pack(desc)
    }

    fn write_files(&self, desc: &mut PackDescription, written: &WrittenPack) -> OdbResult<()> {
        for (ext, data) in [(PackExt::Pack, &written.pack), (PackExt::Index, &written.index)] {
            let mut out = self.storage.write_file(desc, ext)?;
            out.write_all(data)?;
            if out.block_size() > 0 {
                desc.set_block_size(ext, out.block_size());
            }
            out.close()?;
        }
        Ok(())
    }

    fn fire_packs_changed(&self) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener.on_packs_changed(self.repository());
        }
    }
}

impl std::fmt::Debug for ObjectDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectDatabase")
            .field("repository", self.repository())
            .field("packs", &self.current_pack_list().packs().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::thread;

    use dfs_cache::BlockCacheConfig;
    use dfs_types::ObjectType;

    use super::*;
    use crate::memory::InMemoryStorage;

    fn setup() -> (Arc<InMemoryStorage>, Arc<ObjectDatabase>) {
        let storage = Arc::new(InMemoryStorage::new(RepositoryDescription::new("db")));
        let cache = Arc::new(
            BlockCache::new(BlockCacheConfig::default().with_block_size(4096).with_block_limit(4 << 20)).unwrap(),
        );
        let db = Arc::new(ObjectDatabase::new(Arc::clone(&storage), cache));
        (storage, db)
    }

    fn pack_of(db: &ObjectDatabase, source: PackSource, content: &[u8]) -> Arc<PackFile> {
        let mut writer = PackWriter::new();
        writer.add_object(ObjectType::Blob, content);
        db.write_pack(source, writer).unwrap()
    }

    /// Commit a pack to storage without telling the database's list.
    fn commit_behind(storage: &InMemoryStorage, source: PackSource, content: &[u8]) -> PackDescription {
        let mut writer = PackWriter::new();
        writer.add_object(ObjectType::Blob, content);
        let written = writer.finish().unwrap();
        let mut desc = storage.new_pack(source).unwrap();
        written.describe(&mut desc);
        for (ext, data) in [(PackExt::Pack, &written.pack), (PackExt::Index, &written.index)] {
            let mut out = storage.write_file(&desc, ext).unwrap();
            out.write_all(data).unwrap();
            out.close().unwrap();
        }
        storage.commit_pack(&[desc.clone()], &[]).unwrap();
        desc
    }

    fn names(list: &PackList) -> Vec<String> {
        list.packs().iter().map(|p| p.desc().pack_name.clone()).collect()
    }

    #[test]
    fn first_access_scans_and_sorts_by_lookup_order() {
        let (storage, db) = setup();
        let gc = commit_behind(&storage, PackSource::Gc, b"gc");
        let old = commit_behind(&storage, PackSource::Insert, b"old");
        let new = commit_behind(&storage, PackSource::Insert, b"new");

        let list = db.pack_list().unwrap();
        assert_eq!(names(&list), vec![new.pack_name, old.pack_name, gc.pack_name]);
        assert!(!list.is_dirty());
    }

    #[test]
    fn unchanged_scan_keeps_list_and_clears_dirty() {
        let (storage, db) = setup();
        commit_behind(&storage, PackSource::Insert, b"a");
        let first = db.pack_list().unwrap();
        first.mark_dirty();

        let second = db.pack_list().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!second.is_dirty());
    }

    #[test]
    fn rescan_reuses_wrappers_and_replaces_invalid_ones() {
        let (storage, db) = setup();
        let a = commit_behind(&storage, PackSource::Insert, b"a");
        let b = commit_behind(&storage, PackSource::Insert, b"b");
        let first = db.pack_list().unwrap();
        let pack_a = Arc::clone(first.find_pack(&a).unwrap());
        let pack_b = Arc::clone(first.find_pack(&b).unwrap());
        pack_b.file().mark_invalid(Arc::new(std::io::Error::other("gone bad")));

        commit_behind(&storage, PackSource::Insert, b"c");
        db.current_pack_list().mark_dirty();
        let second = db.pack_list().unwrap();
        assert_eq!(second.packs().len(), 3);
        assert!(Arc::ptr_eq(second.find_pack(&a).unwrap(), &pack_a));
        let fresh_b = second.find_pack(&b).unwrap();
        assert!(!Arc::ptr_eq(fresh_b, &pack_b));
        assert!(!fresh_b.is_invalid());
    }

    #[test]
    fn empty_storage_publishes_clean_empty_list() {
        let (_storage, db) = setup();
        let list = db.pack_list().unwrap();
        assert!(list.is_empty());
        assert!(!list.is_dirty());
        assert!(Arc::ptr_eq(&list, &db.pack_list().unwrap()));
    }

    #[test]
    fn add_pack_on_fresh_database_does_not_duplicate() {
        let (storage, db) = setup();
        let desc = commit_behind(&storage, PackSource::Insert, b"x");
        let pack = db.add_pack(desc.clone()).unwrap();
        let list = db.current_pack_list();
        assert_eq!(list.packs().len(), 1);
        assert!(Arc::ptr_eq(&list.packs()[0], &pack));
    }

    #[test]
    fn write_pack_adds_to_front_and_fires_listener() {
        struct Counter(AtomicUsize);
        impl PacksChangedListener for Counter {
            fn on_packs_changed(&self, _: &RepositoryDescription) {
                self.0.fetch_add(1, AtomicOrdering::SeqCst);
            }
        }

        let (_storage, db) = setup();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        db.add_packs_changed_listener(counter.clone());

        pack_of(&db, PackSource::Gc, b"first");
        let second = pack_of(&db, PackSource::Gc, b"second");
        let list = db.current_pack_list();
        assert_eq!(list.packs().len(), 2);
        assert!(Arc::ptr_eq(&list.packs()[0], &second));
        assert!(counter.0.load(AtomicOrdering::SeqCst) >= 2);
    }

    #[test]
    fn commit_pack_replacing_marks_dirty_and_rescan_drops_old() {
        let (_storage, db) = setup();
        let old = pack_of(&db, PackSource::Insert, b"old");
        let compacted = pack_of(&db, PackSource::Compact, b"old+");
        let held = db.current_pack_list();

        db.commit_pack(&[], &[(**old.desc()).clone()]).unwrap();
        assert!(held.is_dirty());
        let list = db.pack_list().unwrap();
        assert_eq!(names(&list), vec![compacted.desc().pack_name.clone()]);
        assert_eq!(held.packs().len(), 2);
    }

    #[test]
    fn add_reftable_replaces_stack_entries() {
        let (storage, db) = setup();
        let mut t1 = storage.new_pack(PackSource::Insert).unwrap();
        t1.add_file_ext(PackExt::Reftable);
        t1.max_update_index = 1;
        let mut t2 = storage.new_pack(PackSource::Insert).unwrap();
        t2.add_file_ext(PackExt::Reftable);
        t2.max_update_index = 2;
        let mut compacted = storage.new_pack(PackSource::Compact).unwrap();
        compacted.add_file_ext(PackExt::Reftable);
        compacted.max_update_index = 2;

        db.add_reftable(t1.clone(), &[]).unwrap();
        db.add_reftable(t2.clone(), &[]).unwrap();
        let tables = db.current_pack_list();
        let order: Vec<_> = tables.reftables().iter().map(|r| r.desc().max_update_index).collect();
        assert_eq!(order, vec![1, 2]);

        db.add_reftable(compacted.clone(), &[t1, t2]).unwrap();
        let tables = db.current_pack_list();
        assert_eq!(tables.reftables().len(), 1);
        assert_eq!(**tables.reftables()[0].desc(), compacted);
    }

    #[test]
    fn clear_cache_forces_rescan() {
        let (_storage, db) = setup();
        let pack = pack_of(&db, PackSource::Insert, b"p");
        db.clear_cache();
        assert!(db.current_pack_list().is_dirty());
        let list = db.pack_list().unwrap();
        assert_eq!(list.packs().len(), 1);
        assert!(!Arc::ptr_eq(&list.packs()[0], &pack));
    }

    #[test]
    fn packs_written_to_a_directory_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(BlockCache::new(BlockCacheConfig::default().with_block_size(4096)).unwrap());
        let open = |cache: &Arc<BlockCache>| {
            let storage = crate::local::LocalDirStorage::open(RepositoryDescription::new("disk"), dir.path())
                .unwrap()
                .with_block_size(4096);
            Arc::new(ObjectDatabase::new(Arc::new(storage), Arc::clone(cache)))
        };

        let db = open(&cache);
        let mut writer = PackWriter::new();
        let id = writer.add_object(ObjectType::Tree, b"100644 file\0");
        let pack = db.write_pack(PackSource::Receive, writer).unwrap();
        assert_eq!(pack.desc().block_size(PackExt::Pack), 4096);

        let reopened = open(&cache);
        let list = reopened.pack_list().unwrap();
        assert_eq!(names(&list), vec![pack.desc().pack_name.clone()]);
        let mut reader = reopened.new_reader();
        let loader = reader.open(&id, Some(ObjectType::Tree)).unwrap();
        assert_eq!(&loader.into_bytes().unwrap()[..], b"100644 file\0");
    }

    #[test]
    fn snapshots_stay_whole_under_concurrent_compaction() {
        let (storage, db) = setup();
        let base = commit_behind(&storage, PackSource::Insert, b"generation 0");
        let before = db.pack_list().unwrap();
        let before_names = names(&before);

        let compactor = {
            let db = Arc::clone(&db);
            let storage = Arc::clone(&storage);
            thread::spawn(move || {
                let mut current = base;
                for generation in 1..=50 {
                    let next = commit_behind(&storage, PackSource::Compact, format!("generation {generation}").as_bytes());
                    storage.commit_pack(&[], &[current.clone()]).unwrap();
                    db.commit_pack(&[], &[]).unwrap();
                    current = next;
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let db = Arc::clone(&db);
                thread::spawn(move || {
                    let mut seen = HashSet::new();
                    for _ in 0..200 {
                        let list = db.pack_list().unwrap();
                        let n = list.packs().len();
                        assert!(n == 1 || n == 2, "torn list with {n} packs");
                        seen.insert(names(&list));
                    }
                    seen.len()
                })
            })
            .collect();

        compactor.join().unwrap();
        for r in readers {
            assert!(r.join().unwrap() >= 1);
        }
        assert_eq!(names(&before), before_names);
        let last = db.pack_list().unwrap();
        assert_eq!(last.packs().len(), 1);
    }
}
