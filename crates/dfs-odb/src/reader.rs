//! Object lookups across the current pack list.
//!
//! A [`Reader`] is the per-thread handle: it owns a [`ReadContext`] (delta
//! base cache, inflater, stats) and remembers the pack that satisfied the
//! last lookup, which is tried first next time.

use std::collections::BTreeSet;
use std::io::{self, Write};
use std::sync::Arc;

use dfs_pack::{
    ObjectLoader, ObjectToPack, PackError, PackFile, PackOutputStream, ReadContext, ReaderOptions, ReaderStats,
    ReopenFn, StoredRepresentation,
};
use dfs_types::{AbbreviatedObjectId, ObjectId, ObjectType};
use tracing::{debug, warn};

use crate::database::ObjectDatabase;
use crate::error::{OdbError, OdbResult};
use crate::pack_list::PackList;

/// Most ids [`Reader::resolve`] reports for one abbreviation.
pub const MAX_RESOLVE_MATCHES: usize = 256;

/// Where and how one object is stored.
#[derive(Clone, Debug)]
pub struct ObjectRepresentation {
    pub id: ObjectId,
    pub pack: Arc<PackFile>,
    pub stored: StoredRepresentation,
}

impl ObjectRepresentation {
    pub fn to_object(&self) -> ObjectToPack {
        self.stored.to_object(self.id)
    }
}

/// An object located during a bulk lookup, not yet read.
struct Located {
    key: (usize, usize, u64),
    id: ObjectId,
    pack: Arc<PackFile>,
    offset: u64,
}

type Fetch<T> = fn(&mut Reader, &Arc<PackFile>, u64, &ObjectId, Option<ObjectType>) -> OdbResult<T>;

/// Results of a bulk lookup, read lazily in pack order.
///
/// Ids found in no pack come first, each as a
/// [`OdbError::MissingObject`]; nothing is read until an item is consumed.
pub struct ObjectQueue<'r, T> {
    reader: &'r mut Reader,
    missing: std::vec::IntoIter<ObjectId>,
    found: std::vec::IntoIter<Located>,
    hint: Option<ObjectType>,
    fetch: Fetch<T>,
}

impl<T> Iterator for ObjectQueue<'_, T> {
    type Item = (ObjectId, OdbResult<T>);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(id) = self.missing.next() {
            let err = OdbError::MissingObject {
                id,
                object_type: self.hint,
            };
            return Some((id, Err(err)));
        }
        let located = self.found.next()?;
        let result = (self.fetch)(self.reader, &located.pack, located.offset, &located.id, self.hint);
        if result.is_ok() {
            self.reader.last = Some(located.pack);
        }
        Some((located.id, result))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.missing.len() + self.found.len();
        (n, Some(n))
    }
}

impl<T> ExactSizeIterator for ObjectQueue<'_, T> {}

/// Reads objects from an [`ObjectDatabase`]. Not shared between threads.
pub struct Reader {
    db: Arc<ObjectDatabase>,
    ctx: ReadContext,
    last: Option<Arc<PackFile>>,
}

impl Reader {
    pub fn new(db: &Arc<ObjectDatabase>) -> Self {
        let ctx = ReadContext::new(Arc::clone(db.opener()), db.options().clone()).with_reopen(reopen_hook(db));
        Self {
            db: Arc::clone(db),
            ctx,
            last: None,
        }
    }

    pub fn database(&self) -> &Arc<ObjectDatabase> {
        &self.db
    }

    pub fn options(&self) -> &ReaderOptions {
        self.ctx.options()
    }

    pub fn stats(&self) -> &ReaderStats {
        self.ctx.stats()
    }

    /// The read context, for streaming large objects.
    pub fn context(&mut self) -> &mut ReadContext {
        &mut self.ctx
    }

    /// Drop cached delta bases and the remembered pack.
    pub fn release(&mut self) {
        self.ctx.release();
        self.last = None;
    }

    // --- single objects -----------------------------------------------------

    pub fn has(&mut self, id: &ObjectId) -> OdbResult<bool> {
        Ok(self.find(id)?.is_some())
    }

    /// Open `id`, checking its type against `hint` when given.
    pub fn open(&mut self, id: &ObjectId, hint: Option<ObjectType>) -> OdbResult<ObjectLoader> {
        match self.find(id)? {
            Some((pack, offset)) => self.load_at(&pack, offset, id, hint),
            None => Err(OdbError::MissingObject {
                id: *id,
                object_type: hint,
            }),
        }
    }

    /// Inflated size of `id`, without inflating it.
    pub fn object_size(&mut self, id: &ObjectId, hint: Option<ObjectType>) -> OdbResult<u64> {
        match self.find(id)? {
            Some((pack, offset)) => self.size_at(&pack, offset, id, hint),
            None => Err(OdbError::MissingObject {
                id: *id,
                object_type: hint,
            }),
        }
    }

    // --- bulk ---------------------------------------------------------------

    /// Open many objects, read in pack order as the queue is consumed.
    pub fn open_all<I>(&mut self, ids: I, hint: Option<ObjectType>) -> OdbResult<ObjectQueue<'_, ObjectLoader>>
    where
        I: IntoIterator<Item = ObjectId>,
    {
        self.queue(ids, hint, Self::load_at)
    }

    /// Sizes of many objects, in pack order.
    pub fn object_sizes<I>(&mut self, ids: I, hint: Option<ObjectType>) -> OdbResult<ObjectQueue<'_, u64>>
    where
        I: IntoIterator<Item = ObjectId>,
    {
        self.queue(ids, hint, Self::size_at)
    }

    fn queue<I, T>(&mut self, ids: I, hint: Option<ObjectType>, fetch: Fetch<T>) -> OdbResult<ObjectQueue<'_, T>>
    where
        I: IntoIterator<Item = ObjectId>,
    {
        let (found, missing) = self.locate_all(ids.into_iter().collect())?;
        Ok(ObjectQueue {
            reader: self,
            missing: missing.into_iter(),
            found: found.into_iter(),
            hint,
            fetch,
        })
    }

    fn locate_all(&mut self, ids: Vec<ObjectId>) -> OdbResult<(Vec<Located>, Vec<ObjectId>)> {
        let mut list = self.db.pack_list()?;
        let mut found = Vec::with_capacity(ids.len());
        let mut pending = ids;
        for round in 0..2 {
            let last = self
                .last
                .as_ref()
                .and_then(|last| list.packs().iter().position(|p| Arc::ptr_eq(p, last)));
            let mut missing = Vec::new();
            'ids: for id in pending {
                let candidates = last.into_iter().chain(0..list.packs().len());
                for (n, i) in candidates.enumerate() {
                    if n > 0 && Some(i) == last {
                        continue;
                    }
                    let pack = &list.packs()[i];
                    if let Some(offset) = self.offset_in(pack, &id)? {
                        found.push(Located {
                            key: (round, i, offset),
                            id,
                            pack: Arc::clone(pack),
                            offset,
                        });
                        continue 'ids;
                    }
                }
                missing.push(id);
            }
            pending = missing;
            if pending.is_empty() || round == 1 || !list.is_dirty() {
                break;
            }
            list = self.db.scan_packs(&list)?;
        }
        found.sort_by_key(|l| l.key);
        Ok((found, pending))
    }

    // --- abbreviations ------------------------------------------------------

    /// Every id starting with `abbrev`, at most [`MAX_RESOLVE_MATCHES`].
    ///
    /// A complete id is returned as is. Unreachable-garbage packs are never
    /// consulted.
    pub fn resolve(&mut self, abbrev: &AbbreviatedObjectId) -> OdbResult<BTreeSet<ObjectId>> {
        if let Some(id) = abbrev.to_object_id() {
            return Ok(BTreeSet::from([id]));
        }
        let mut matches = BTreeSet::new();
        let list = self.db.pack_list()?;
        self.resolve_in(&list, &mut matches, abbrev)?;
        if matches.len() < MAX_RESOLVE_MATCHES && list.is_dirty() {
            let list = self.db.scan_packs(&list)?;
            self.resolve_in(&list, &mut matches, abbrev)?;
        }
        Ok(matches)
    }

    fn resolve_in(
        &mut self,
        list: &PackList,
        matches: &mut BTreeSet<ObjectId>,
        abbrev: &AbbreviatedObjectId,
    ) -> OdbResult<()> {
        for pack in list.packs() {
            if matches.len() >= MAX_RESOLVE_MATCHES {
                break;
            }
            if pack.is_garbage() || pack.is_invalid() {
                continue;
            }
            match pack.resolve(&mut self.ctx, matches, abbrev, MAX_RESOLVE_MATCHES) {
                Err(err) if pack.is_invalid() => skip_invalid(pack, &err),
                other => other?,
            }
        }
        Ok(())
    }

    // --- as-is copies -------------------------------------------------------

    /// How `id` is stored in the first pack holding it.
    pub fn representation(&mut self, id: &ObjectId) -> OdbResult<Option<ObjectRepresentation>> {
        let Some((pack, _)) = self.find(id)? else {
            return Ok(None);
        };
        Ok(pack
            .representation(&mut self.ctx, id)?
            .map(|stored| ObjectRepresentation { id: *id, pack, stored }))
    }

    /// Copy the stored entry behind `rep` into `out`.
    pub fn copy_object_as_is<W: Write>(
        &mut self,
        out: &mut PackOutputStream<W>,
        rep: &ObjectRepresentation,
        validate: bool,
    ) -> OdbResult<()> {
        rep.pack.copy_as_is(&mut self.ctx, out, &rep.to_object(), validate)?;
        Ok(())
    }

    /// Copy every entry of `pack` into `out`, returning the bytes written.
    pub fn copy_pack_as_is(&mut self, pack: &PackFile, out: &mut dyn Write) -> OdbResult<u64> {
        Ok(pack.copy_pack_as_is(&mut self.ctx, out)?)
    }

    // --- lookup -------------------------------------------------------------

    fn skip(&self, pack: &PackFile) -> bool {
        pack.is_invalid() || (self.ctx.options().avoid_unreachable_objects && pack.is_garbage())
    }

    /// Offset of a readable copy of `id` in `pack`. A pack that turns out
    /// to be unreadable is treated as not holding it.
    fn offset_in(&mut self, pack: &PackFile, id: &ObjectId) -> OdbResult<Option<u64>> {
        if self.skip(pack) {
            return Ok(None);
        }
        match pack.find_offset(&mut self.ctx, id) {
            Ok(Some(offset)) if offset > 0 && !pack.is_corrupt(offset) => Ok(Some(offset)),
            Ok(_) => Ok(None),
            Err(err) if pack.is_invalid() => {
                skip_invalid(pack, &err);
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn search(&mut self, list: &PackList, id: &ObjectId) -> OdbResult<Option<(Arc<PackFile>, u64)>> {
        for pack in list.packs() {
            if self.last.as_ref().is_some_and(|last| Arc::ptr_eq(last, pack)) {
                continue;
            }
            if let Some(offset) = self.offset_in(pack, id)? {
                self.last = Some(Arc::clone(pack));
                return Ok(Some((Arc::clone(pack), offset)));
            }
        }
        Ok(None)
    }

    /// The pack and offset holding `id`: the last pack used, then the
    /// list, then the list again after one rescan if it went dirty.
    fn find(&mut self, id: &ObjectId) -> OdbResult<Option<(Arc<PackFile>, u64)>> {
        if let Some(last) = self.last.clone() {
            if let Some(offset) = self.offset_in(&last, id)? {
                return Ok(Some((last, offset)));
            }
        }
        let list = self.db.pack_list()?;
        if let Some(hit) = self.search(&list, id)? {
            return Ok(Some(hit));
        }
        if !list.is_dirty() {
            return Ok(None);
        }
        let list = self.db.scan_packs(&list)?;
        self.search(&list, id)
    }

    fn load_at(
        &mut self,
        pack: &Arc<PackFile>,
        offset: u64,
        id: &ObjectId,
        hint: Option<ObjectType>,
    ) -> OdbResult<ObjectLoader> {
        let loader = match pack.load(&mut self.ctx, offset)? {
            ObjectLoader::Large(large) => ObjectLoader::Large(large.with_id(*id)),
            small => small,
        };
        check_type(id, hint, loader.object_type())?;
        Ok(loader)
    }

    fn size_at(
        &mut self,
        pack: &Arc<PackFile>,
        offset: u64,
        id: &ObjectId,
        hint: Option<ObjectType>,
    ) -> OdbResult<u64> {
        if hint.is_some() {
            check_type(id, hint, pack.object_type(&mut self.ctx, offset)?)?;
        }
        Ok(pack.object_size(&mut self.ctx, offset)?)
    }
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("repository", self.db.repository())
            .field("last", &self.last.as_ref().map(|p| p.desc().pack_name.clone()))
            .field("stats", self.ctx.stats())
            .finish()
    }
}

fn check_type(id: &ObjectId, expected: Option<ObjectType>, actual: ObjectType) -> OdbResult<()> {
    match expected {
        Some(expected) if expected != actual => Err(OdbError::IncorrectObjectType {
            id: *id,
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

fn skip_invalid(pack: &PackFile, err: &PackError) {
    warn!(pack = %pack.desc().pack_name, error = %err, "skipping unreadable pack");
}

/// Large objects whose pack disappears are looked up again by id, after a
/// rescan, through a fresh reader.
fn reopen_hook(db: &Arc<ObjectDatabase>) -> ReopenFn {
    let db = Arc::downgrade(db);
    Arc::new(move |id: &ObjectId, object_type: ObjectType| {
        let Some(db) = db.upgrade() else {
            return Err(PackError::MissingObject(*id));
        };
        debug!(object = %id.short_hex(), "reopening object in current packs");
        db.current_pack_list().mark_dirty();
        Reader::new(&db).open(id, Some(object_type)).map_err(|err| match err {
            OdbError::Pack(err) => err,
            OdbError::MissingObject { id, .. } => PackError::MissingObject(id),
            other => PackError::Io(io::Error::other(other)),
        })
    })
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use dfs_cache::{BlockCache, BlockCacheConfig};
    use dfs_pack::{deflate, PackIndex, PackWriter, WrittenPack};
    use dfs_types::{PackSource, RepositoryDescription, OBJECT_ID_LENGTH};

    use super::*;
    use crate::memory::InMemoryStorage;
    use crate::storage::DfsStorage;

    fn setup_with(options: ReaderOptions) -> (Arc<InMemoryStorage>, Arc<ObjectDatabase>) {
        let storage = Arc::new(InMemoryStorage::new(RepositoryDescription::new("reader")));
        let cache = Arc::new(
            BlockCache::new(BlockCacheConfig::default().with_block_size(4096).with_block_limit(4 << 20)).unwrap(),
        );
        let db = Arc::new(ObjectDatabase::new(Arc::clone(&storage), cache).with_options(options));
        (storage, db)
    }

    fn setup() -> (Arc<InMemoryStorage>, Arc<ObjectDatabase>) {
        setup_with(ReaderOptions::default())
    }

    fn blobs(db: &ObjectDatabase, source: PackSource, contents: &[&[u8]]) -> (Arc<PackFile>, Vec<ObjectId>) {
        let mut writer = PackWriter::new();
        let ids = contents.iter().map(|c| writer.add_object(ObjectType::Blob, c)).collect();
        (db.write_pack(source, writer).unwrap(), ids)
    }

    fn prefixed(prefix: [u8; 2], n: u32) -> ObjectId {
        let mut hash = [0u8; OBJECT_ID_LENGTH];
        hash[..2].copy_from_slice(&prefix);
        hash[OBJECT_ID_LENGTH - 4..].copy_from_slice(&n.to_be_bytes());
        ObjectId::from_hash(hash)
    }

    /// A pack of blobs stored under arbitrary ids.
    fn pack_with_ids(db: &ObjectDatabase, source: PackSource, ids: &[ObjectId]) -> Arc<PackFile> {
        let mut out = PackOutputStream::new(Vec::new());
        out.write_file_header(ids.len() as u32).unwrap();
        for id in ids {
            let content = id.to_hex();
            out.write_object_header(*id, ObjectType::Blob, content.len() as u64).unwrap();
            out.write_all(&deflate(content.as_bytes()).unwrap()).unwrap();
        }
        let (pack, entries, checksum) = out.finish().unwrap();
        let written = WrittenPack::from_parts(pack, PackIndex::build(entries, checksum), 0);
        db.store_pack(source, &written).unwrap()
    }

    fn abbrev(hex: &str) -> AbbreviatedObjectId {
        AbbreviatedObjectId::from_hex(hex).unwrap()
    }

    #[test]
    fn open_checks_types_and_reports_missing() {
        let (_storage, db) = setup();
        let mut writer = PackWriter::new();
        let blob = writer.add_object(ObjectType::Blob, b"hello");
        let commit = writer.add_object(ObjectType::Commit, b"tree 0000\n\nmsg\n");
        db.write_pack(PackSource::Insert, writer).unwrap();

        let mut reader = db.new_reader();
        assert!(reader.has(&blob).unwrap());
        let loader = reader.open(&blob, None).unwrap();
        assert_eq!(&loader.into_bytes().unwrap()[..], b"hello");
        assert_eq!(reader.object_size(&blob, Some(ObjectType::Blob)).unwrap(), 5);
        assert!(matches!(
            reader.open(&commit, Some(ObjectType::Tree)),
            Err(OdbError::IncorrectObjectType {
                expected: ObjectType::Tree,
                actual: ObjectType::Commit,
                ..
            })
        ));
        assert!(matches!(
            reader.object_size(&commit, Some(ObjectType::Blob)),
            Err(OdbError::IncorrectObjectType { .. })
        ));

        let absent = ObjectId::digest(b"absent");
        assert!(!reader.has(&absent).unwrap());
        let err = reader.open(&absent, Some(ObjectType::Blob)).unwrap_err();
        assert!(err.is_missing());
        assert!(matches!(
            err,
            OdbError::MissingObject {
                object_type: Some(ObjectType::Blob),
                ..
            }
        ));
        assert!(reader.stats().index_loads >= 1);
    }

    #[test]
    fn pack_committed_elsewhere_is_seen_once_list_is_dirty() {
        let (storage, db) = setup();
        blobs(&db, PackSource::Insert, &[b"first"]);
        let mut reader = db.new_reader();

        let mut writer = PackWriter::new();
        let id = writer.add_object(ObjectType::Blob, b"from another process");
        let written = writer.finish().unwrap();
        let mut desc = storage.new_pack(PackSource::Receive).unwrap();
        written.describe(&mut desc);
        for (ext, data) in [
            (dfs_types::PackExt::Pack, &written.pack),
            (dfs_types::PackExt::Index, &written.index),
        ] {
            let mut out = storage.write_file(&desc, ext).unwrap();
            out.write_all(data).unwrap();
            out.close().unwrap();
        }
        storage.commit_pack(&[desc], &[]).unwrap();

        assert!(!reader.has(&id).unwrap());
        db.current_pack_list().mark_dirty();
        assert!(reader.has(&id).unwrap());
    }

    #[test]
    fn open_all_reads_in_pack_order_and_defers_missing() {
        let (_storage, db) = setup();
        let (_, older) = blobs(&db, PackSource::Insert, &[b"a", b"b"]);
        let (_, newer) = blobs(&db, PackSource::Insert, &[b"c"]);
        let absent = ObjectId::digest(b"absent");

        let mut reader = db.new_reader();
        let queue = reader.open_all([older[1], absent, newer[0], older[0]], None).unwrap();
        assert_eq!(queue.len(), 4);
        let results: Vec<_> = queue.collect();

        let order: Vec<_> = results.iter().map(|(id, _)| *id).collect();
        assert_eq!(order, vec![absent, newer[0], older[0], older[1]]);
        assert!(results[0].1.as_ref().is_err_and(|e| e.is_missing()));
        let contents: Vec<_> = results[1..]
            .iter()
            .map(|(_, r)| r.as_ref().unwrap().cached_bytes().unwrap().to_vec())
            .collect();
        assert_eq!(contents, vec![b"c".to_vec(), b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn object_sizes_report_type_errors_per_item() {
        let (_storage, db) = setup();
        let mut writer = PackWriter::new();
        let blob = writer.add_object(ObjectType::Blob, b"12345");
        let tree = writer.add_object(ObjectType::Tree, b"tree bytes");
        db.write_pack(PackSource::Insert, writer).unwrap();

        let mut reader = db.new_reader();
        let results: Vec<_> = reader
            .object_sizes([blob, tree], Some(ObjectType::Blob))
            .unwrap()
            .collect();
        assert_eq!(results[0].0, blob);
        assert_eq!(*results[0].1.as_ref().unwrap(), 5);
        assert_eq!(results[1].0, tree);
        assert!(matches!(results[1].1, Err(OdbError::IncorrectObjectType { .. })));
    }

    #[test]
    fn resolve_complete_id_is_returned_as_is() {
        let (_storage, db) = setup();
        let id = ObjectId::digest(b"not stored anywhere");
        let mut reader = db.new_reader();
        let found = reader.resolve(&abbrev(&id.to_hex())).unwrap();
        assert_eq!(found.into_iter().collect::<Vec<_>>(), vec![id]);
    }

    #[test]
    fn resolve_singleton_pair_and_cap() {
        let (_storage, db) = setup();
        let other = prefixed([0xab, 0xce], 1);
        pack_with_ids(&db, PackSource::Insert, &[prefixed([0xab, 0xcd], 1), other]);
        let mut reader = db.new_reader();
        assert_eq!(reader.resolve(&abbrev("abcd")).unwrap().len(), 1);

        pack_with_ids(&db, PackSource::Insert, &[prefixed([0xab, 0xcd], 2)]);
        let pair = reader.resolve(&abbrev("abcd")).unwrap();
        assert_eq!(pair.len(), 2);
        assert!(!pair.contains(&other));

        let many: Vec<_> = (100..400).map(|n| prefixed([0xab, 0xcd], n)).collect();
        pack_with_ids(&db, PackSource::Gc, &many);
        assert_eq!(reader.resolve(&abbrev("abcd")).unwrap().len(), MAX_RESOLVE_MATCHES);
        assert!(reader.resolve(&abbrev("abcf")).unwrap().is_empty());
    }

    #[test]
    fn garbage_packs_are_skipped_when_asked() {
        let id = prefixed([0xab, 0xcd], 7);
        let (_storage, db) = setup();
        pack_with_ids(&db, PackSource::UnreachableGarbage, &[id]);
        let mut reader = db.new_reader();
        assert!(reader.has(&id).unwrap());
        assert!(reader.resolve(&abbrev("abcd")).unwrap().is_empty());

        let (_storage, db) = setup_with(ReaderOptions {
            avoid_unreachable_objects: true,
            ..ReaderOptions::default()
        });
        pack_with_ids(&db, PackSource::UnreachableGarbage, &[id]);
        let mut reader = db.new_reader();
        assert!(!reader.has(&id).unwrap());
    }

    #[test]
    fn large_object_stream_survives_pack_removal() {
        let options = ReaderOptions {
            stream_file_threshold: 1024,
            ..ReaderOptions::default()
        };
        let (storage, db) = setup_with(options);
        let data: Vec<u8> = (0..20_000u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();
        let (_, ids) = blobs(&db, PackSource::Gc, &[&data]);
        let (doomed, _) = blobs(&db, PackSource::Insert, &[&data]);
        let id = ids[0];

        let mut reader = db.new_reader();
        let loader = reader.open(&id, Some(ObjectType::Blob)).unwrap();
        match &loader {
            ObjectLoader::Large(large) => assert!(Arc::ptr_eq(large.pack(), &doomed)),
            other => panic!("expected a large object, got {other:?}"),
        }

        storage.commit_pack(&[], &[(**doomed.desc()).clone()]).unwrap();
        doomed.file().mark_invalid(Arc::new(io::Error::other("pack deleted")));

        let mut content = Vec::new();
        loader
            .open_stream(reader.context())
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, data);
        assert!(db.current_pack_list().find_pack(doomed.desc()).is_none());
    }

    #[test]
    fn representations_copy_into_a_new_pack() {
        let (_storage, db) = setup();
        let base: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let mut target = base.clone();
        target.extend_from_slice(b"tail");
        let mut writer = PackWriter::new();
        let base_id = writer.add_object(ObjectType::Blob, &base);
        let delta_id = writer.add_delta(&base_id, &target).unwrap();
        let source = db.write_pack(PackSource::Insert, writer).unwrap();

        let mut reader = db.new_reader();
        let rep = reader.representation(&delta_id).unwrap().unwrap();
        assert!(Arc::ptr_eq(&rep.pack, &source));
        assert_eq!(rep.stored.delta_base, Some(base_id));
        assert!(reader.representation(&ObjectId::digest(b"none")).unwrap().is_none());

        let mut out = PackOutputStream::new(Vec::new());
        out.write_file_header(2).unwrap();
        for id in [base_id, delta_id] {
            let rep = reader.representation(&id).unwrap().unwrap();
            reader.copy_object_as_is(&mut out, &rep, true).unwrap();
        }
        let (pack, entries, checksum) = out.finish().unwrap();
        let copy = db
            .store_pack(PackSource::Compact, &WrittenPack::from_parts(pack, PackIndex::build(entries, checksum), 1))
            .unwrap();
        assert_eq!(reader.stats().as_is_copies, 2);

        let mut fresh = db.new_reader();
        let rep = fresh.representation(&delta_id).unwrap().unwrap();
        assert!(Arc::ptr_eq(&rep.pack, &copy));
        let loaded = fresh.open(&delta_id, Some(ObjectType::Blob)).unwrap();
        assert_eq!(loaded.into_bytes().unwrap().to_vec(), target);

        let mut raw = Vec::new();
        let copied = fresh.copy_pack_as_is(&source, &mut raw).unwrap();
        assert_eq!(copied, raw.len() as u64);
        assert_eq!(copied, source.desc().file_size(dfs_types::PackExt::Pack) - 12 - OBJECT_ID_LENGTH as u64);
    }

    #[test]
    fn release_forgets_last_pack() {
        let (_storage, db) = setup();
        let (_, ids) = blobs(&db, PackSource::Insert, &[b"x"]);
        let mut reader = db.new_reader();
        reader.open(&ids[0], None).unwrap();
        assert!(format!("{reader:?}").contains("pack-"));
        reader.release();
        assert!(reader.last.is_none());
        assert!(reader.has(&ids[0]).unwrap());
    }
}
