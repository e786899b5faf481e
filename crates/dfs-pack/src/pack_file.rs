//! Reading objects out of one pack through the block cache.
//!
//! The `.idx`, its reverse index and the `.bitmap` are parsed on first use
//! and cached as typed references, charged to the same budget as blocks.
//! Object payloads are inflated straight out of cached pack blocks.

use std::collections::{BTreeSet, HashSet};
use std::io::{self, Write};
use std::sync::Arc;

use bytes::Bytes;
use dfs_cache::{read_fully, Block, BlockBasedFile, BlockCache, CacheRef, StreamKey, REF_POSITION};
use dfs_types::{AbbreviatedObjectId, ObjectId, ObjectType, PackDescription, PackExt};
use flate2::{FlushDecompress, Status};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::bitmap::BitmapIndex;
use crate::context::ReadContext;
use crate::delta::{apply_delta, delta_sizes};
use crate::error::{PackError, PackResult};
use crate::format::{parse_entry_header, EntryHeader, EntryKind, MAX_ENTRY_HEADER, PACK_HEADER_SIZE, PACK_TRAILER_SIZE};
use crate::index::{PackIndex, INDEX_BYTES_PER_OBJECT};
use crate::large_object::{LargeObject, ObjectLoader};
use crate::output::{ObjectToPack, PackOutputStream};
use crate::reverse_index::{ReverseIndex, REVERSE_INDEX_BYTES_PER_OBJECT};

/// Largest object that can be materialized in one buffer.
const MAX_ARRAY_SIZE: u64 = i32::MAX as u64;

/// Enough inflated delta bytes to hold both size headers.
const DELTA_SIZES_PREFIX: usize = 20;

/// One delta on the way from a requested object down to its base.
#[derive(Clone, Copy, Debug)]
struct DeltaLink {
    position: u64,
    size: u64,
    header_len: usize,
    base_position: u64,
}

/// How an object is stored in a pack, for reuse when writing a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoredRepresentation {
    pub offset: u64,
    /// Bytes of the whole entry, header included.
    pub length: u64,
    pub object_type: ObjectType,
    /// Inflated size of the stored payload (the delta, for deltas).
    pub stored_size: u64,
    pub delta_base: Option<ObjectId>,
}

impl StoredRepresentation {
    pub fn to_object(&self, id: ObjectId) -> ObjectToPack {
        ObjectToPack {
            id,
            object_type: self.object_type,
            offset: self.offset,
            delta_base: self.delta_base,
        }
    }
}

struct AsIs {
    header: EntryHeader,
    data_start: u64,
    end: u64,
    delta_base: Option<ObjectId>,
}

/// A pack file and its indexes.
pub struct PackFile {
    file: BlockBasedFile,
    index_key: StreamKey,
    reverse_key: StreamKey,
    bitmap_key: StreamKey,
    index: Mutex<Option<CacheRef<PackIndex>>>,
    reverse: Mutex<Option<CacheRef<ReverseIndex>>>,
    bitmap: Mutex<Option<CacheRef<BitmapIndex>>>,
    corrupt: Mutex<HashSet<u64>>,
}

impl PackFile {
    pub fn new(cache: Arc<BlockCache>, desc: Arc<PackDescription>) -> Self {
        let index_key = StreamKey::of(&desc.repository, desc.file_name(PackExt::Index), PackExt::Index);
        let reverse_key = index_key.for_reverse_index();
        let bitmap_key = StreamKey::of(
            &desc.repository,
            desc.file_name(PackExt::BitmapIndex),
            PackExt::BitmapIndex,
        );
        Self {
            file: BlockBasedFile::new(cache, desc, PackExt::Pack),
            index_key,
            reverse_key,
            bitmap_key,
            index: Mutex::new(None),
            reverse: Mutex::new(None),
            bitmap: Mutex::new(None),
            corrupt: Mutex::new(HashSet::new()),
        }
    }

    pub fn desc(&self) -> &Arc<PackDescription> {
        self.file.desc()
    }

    pub fn file(&self) -> &BlockBasedFile {
        &self.file
    }

    /// Cache key of the `.pack` file.
    pub fn key(&self) -> &StreamKey {
        self.file.key()
    }

    pub fn is_invalid(&self) -> bool {
        self.file.is_invalid()
    }

    pub fn is_garbage(&self) -> bool {
        self.desc().is_garbage()
    }

    // --- indexes ------------------------------------------------------------

    /// The primary index. A failure to load it invalidates the pack.
    pub fn index(&self, ctx: &mut ReadContext) -> PackResult<Arc<PackIndex>> {
        if let Some(idx) = live(&self.index) {
            return Ok(idx);
        }

        let cache = Arc::clone(self.file.cache());
        let mut loaded = None;
        let r: PackResult<CacheRef<PackIndex>> =
            cache.get_or_load_ref(&self.index_key, REF_POSITION, || {
                let idx = self.load_index(ctx)?;
                let size = idx.object_count() * INDEX_BYTES_PER_OBJECT;
                loaded = Some(size);
                Ok((idx, size))
            });
        let r = match r {
            Ok(r) => r,
            Err(err) => {
                if !self.file.is_invalid() {
                    self.file.mark_invalid(Arc::new(err));
                }
                return Err(self.file.invalid_error().into());
            }
        };

        if let Some(size) = loaded {
            ctx.stats.index_loads += 1;
            ctx.stats.index_bytes += size as u64;
            debug!(pack = %self.desc().pack_name, objects = size / INDEX_BYTES_PER_OBJECT, "loaded pack index");
        }
        *self.index.lock() = Some(r.clone());
        Ok(r.into_value())
    }

    fn load_index(&self, ctx: &ReadContext) -> PackResult<PackIndex> {
        if self.file.is_invalid() {
            return Err(self.file.invalid_error().into());
        }
        let data = self.read_file(ctx, PackExt::Index)?;
        let idx = PackIndex::parse(&data)?;
        let declared = self.desc().object_count;
        if declared != 0 && declared != idx.object_count() as u64 {
            return Err(PackError::Index(format!(
                "index lists {} objects, pack description {declared}",
                idx.object_count()
            )));
        }
        Ok(idx)
    }

    /// Offset-ordered view of the index.
    pub fn reverse_index(&self, ctx: &mut ReadContext) -> PackResult<Arc<ReverseIndex>> {
        if let Some(rev) = live(&self.reverse) {
            return Ok(rev);
        }
        let idx = self.index(ctx)?;
        let r: PackResult<CacheRef<ReverseIndex>> =
            self.file
                .cache()
                .get_or_load_ref(&self.reverse_key, REF_POSITION, || {
                    let size = idx.object_count() * REVERSE_INDEX_BYTES_PER_OBJECT;
                    Ok((ReverseIndex::new(&idx), size))
                });
        let r = r?;
        *self.reverse.lock() = Some(r.clone());
        Ok(r.into_value())
    }

    /// The bitmap index, if the pack has one.
    pub fn bitmap_index(&self, ctx: &mut ReadContext) -> PackResult<Option<Arc<BitmapIndex>>> {
        if !self.desc().has_file_ext(PackExt::BitmapIndex) {
            return Ok(None);
        }
        if let Some(bitmap) = live(&self.bitmap) {
            return Ok(Some(bitmap));
        }

        let idx = self.index(ctx)?;
        let mut loaded = false;
        let r: PackResult<CacheRef<BitmapIndex>> =
            self.file
                .cache()
                .get_or_load_ref(&self.bitmap_key, REF_POSITION, || {
                    let data = self.read_file(ctx, PackExt::BitmapIndex)?;
                    let bitmap = BitmapIndex::parse(&data)?;
                    if bitmap.pack_checksum() != idx.pack_checksum() {
                        return Err(PackError::Format(format!(
                            "bitmap index does not belong to {}",
                            self.desc().pack_name
                        )));
                    }
                    loaded = true;
                    Ok((bitmap, data.len()))
                });
        let r = r?;
        if loaded {
            ctx.stats.bitmap_loads += 1;
        }
        *self.bitmap.lock() = Some(r.clone());
        Ok(Some(r.into_value()))
    }

    fn read_file(&self, ctx: &ReadContext, ext: PackExt) -> PackResult<Vec<u8>> {
        let mut rc = ctx.opener().open_file(self.desc(), ext)?;
        let size = rc.size()?;
        if let Some(size) = size {
            rc.set_read_ahead_bytes(size as usize)?;
        }
        let chunk = match rc.block_size() {
            0 => self.file.cache().block_size(),
            n => n,
        } as usize;
        let mut data = Vec::with_capacity(size.unwrap_or(0) as usize);
        let mut buf = vec![0u8; chunk];
        loop {
            let n = rc.read(&mut buf)?;
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
        }
        Ok(data)
    }

    // --- lookup -------------------------------------------------------------

    pub fn object_count(&self, ctx: &mut ReadContext) -> PackResult<usize> {
        Ok(self.index(ctx)?.object_count())
    }

    pub fn find_offset(&self, ctx: &mut ReadContext, id: &ObjectId) -> PackResult<Option<u64>> {
        Ok(self.index(ctx)?.find_offset(id))
    }

    /// True if the pack holds a readable copy of `id`.
    pub fn has_object(&self, ctx: &mut ReadContext, id: &ObjectId) -> PackResult<bool> {
        Ok(matches!(
            self.find_offset(ctx, id)?,
            Some(offset) if offset > 0 && !self.is_corrupt(offset)
        ))
    }

    pub fn get(self: &Arc<Self>, ctx: &mut ReadContext, id: &ObjectId) -> PackResult<Option<ObjectLoader>> {
        match self.find_offset(ctx, id)? {
            Some(offset) if offset > 0 => Ok(Some(match self.load(ctx, offset)? {
                ObjectLoader::Large(large) => ObjectLoader::Large(large.with_id(*id)),
                small => small,
            })),
            _ => Ok(None),
        }
    }

    /// Add ids starting with `prefix` to `matches`, up to `limit`.
    pub fn resolve(
        &self,
        ctx: &mut ReadContext,
        matches: &mut BTreeSet<ObjectId>,
        prefix: &AbbreviatedObjectId,
        limit: usize,
    ) -> PackResult<()> {
        self.index(ctx)?.resolve(matches, prefix, limit);
        Ok(())
    }

    pub fn is_corrupt(&self, offset: u64) -> bool {
        self.corrupt.lock().contains(&offset)
    }

    /// Remember `offset` as unreadable and invalidate the pack, so later
    /// reads fail before touching storage.
    fn mark_corrupt(&self, ctx: &mut ReadContext, offset: u64, err: &PackError) {
        if self.corrupt.lock().insert(offset) {
            ctx.stats.corrupt_objects += 1;
            warn!(file = self.file.file_name(), offset, error = %err, "marking object corrupt");
        }
        self.file
            .mark_invalid(Arc::new(io::Error::new(io::ErrorKind::InvalidData, err.to_string())));
    }

    fn corrupt_object(&self, offset: u64, reason: impl Into<String>) -> PackError {
        PackError::CorruptObject {
            offset,
            file: self.file.file_name().to_string(),
            reason: reason.into(),
        }
    }

    // --- loading ------------------------------------------------------------

    /// Load the object whose entry starts at `offset`.
    pub fn load(self: &Arc<Self>, ctx: &mut ReadContext, offset: u64) -> PackResult<ObjectLoader> {
        if self.is_corrupt(offset) {
            return Err(self.corrupt_object(offset, "object previously marked corrupt"));
        }
        match self.load_object(ctx, offset) {
            Err(err @ PackError::CorruptObject { .. }) => {
                self.mark_corrupt(ctx, offset, &err);
                Err(err)
            }
            other => other,
        }
    }

    fn load_object(self: &Arc<Self>, ctx: &mut ReadContext, offset: u64) -> PackResult<ObjectLoader> {
        let mut chain: Vec<DeltaLink> = Vec::new();
        let mut pos = offset;
        let mut base_from_cache = false;

        let (object_type, mut data) = loop {
            if !chain.is_empty() {
                if let Some(base) = ctx.base_cache.get(self.key(), pos) {
                    ctx.stats.delta_base_cache_hits += 1;
                    base_from_cache = true;
                    break base;
                }
            }

            let header = self.read_entry_header(ctx, pos)?;
            let data_start = pos + header.header_len as u64;
            let base_position = match header.kind {
                EntryKind::Whole(ty) => {
                    let threshold = ctx.options().stream_file_threshold;
                    if chain.is_empty() && header.size >= threshold {
                        ctx.stats.large_objects += 1;
                        return Ok(ObjectLoader::Large(LargeObject::new(
                            Arc::clone(self),
                            pos,
                            data_start,
                            ty,
                            header.size,
                            threshold,
                        )));
                    }
                    break (ty, self.inflate_entry(ctx, pos, data_start, header.size)?);
                }
                EntryKind::OfsDelta { base_offset } => base_offset,
                EntryKind::RefDelta { base } => {
                    let base_offset = self
                        .index(ctx)?
                        .find_offset(&base)
                        .ok_or(PackError::MissingDeltaBase { base, offset: pos })?;
                    if base_offset == pos || chain.iter().any(|l| l.position == base_offset) {
                        return Err(self.corrupt_object(offset, "delta chain loops"));
                    }
                    base_offset
                }
            };
            chain.push(DeltaLink {
                position: pos,
                size: header.size,
                header_len: header.header_len,
                base_position,
            });
            pos = base_position;
        };

        for (n, link) in chain.iter().enumerate().rev() {
            if n == 0 && !(base_from_cache && chain.len() == 1) {
                ctx.base_cache
                    .put(self.key(), link.base_position, object_type, data.clone());
            }

            let delta_start = link.position + link.header_len as u64;
            let delta = self.inflate_entry(ctx, link.position, delta_start, link.size)?;
            let (_, result_size) =
                delta_sizes(&delta).map_err(|e| self.corrupt_object(link.position, e.to_string()))?;
            if result_size > MAX_ARRAY_SIZE {
                return Err(PackError::LargeObjectExceedsLimit {
                    offset: link.position,
                    size: result_size,
                    limit: MAX_ARRAY_SIZE,
                });
            }
            let mut out = Vec::new();
            out.try_reserve_exact(result_size as usize)
                .map_err(|_| PackError::LargeObjectOutOfMemory {
                    offset: link.position,
                    size: result_size,
                })?;
            apply_delta(&data, &delta, &mut out)
                .map_err(|e| self.corrupt_object(link.position, e.to_string()))?;
            data = Bytes::from(out);
            ctx.stats.deltas_applied += 1;
        }

        ctx.stats.objects_loaded += 1;
        Ok(ObjectLoader::Small { object_type, data })
    }

    /// Inflated size of the object at `offset`, reading only headers.
    pub fn object_size(&self, ctx: &mut ReadContext, offset: u64) -> PackResult<u64> {
        if self.is_corrupt(offset) {
            return Err(self.corrupt_object(offset, "object previously marked corrupt"));
        }
        let header = self.read_entry_header(ctx, offset)?;
        if !header.kind.is_delta() {
            return Ok(header.size);
        }
        let mut prefix = [0u8; DELTA_SIZES_PREFIX];
        let (n, _) = self.inflate_at(ctx, offset, offset + header.header_len as u64, &mut prefix)?;
        delta_sizes(&prefix[..n])
            .map(|(_, result)| result)
            .map_err(|e| self.corrupt_object(offset, e.to_string()))
    }

    /// Type of the object at `offset`, following deltas to their base.
    pub fn object_type(&self, ctx: &mut ReadContext, offset: u64) -> PackResult<ObjectType> {
        let mut pos = offset;
        let mut seen = Vec::new();
        loop {
            match self.read_entry_header(ctx, pos)?.kind {
                EntryKind::Whole(ty) => return Ok(ty),
                EntryKind::OfsDelta { base_offset } => pos = base_offset,
                EntryKind::RefDelta { base } => {
                    seen.push(pos);
                    pos = self
                        .index(ctx)?
                        .find_offset(&base)
                        .ok_or(PackError::MissingDeltaBase { base, offset: pos })?;
                    if seen.contains(&pos) {
                        return Err(self.corrupt_object(offset, "delta chain loops"));
                    }
                }
            }
        }
    }

    /// How `id` is stored, if present.
    pub fn representation(
        &self,
        ctx: &mut ReadContext,
        id: &ObjectId,
    ) -> PackResult<Option<StoredRepresentation>> {
        let Some(offset) = self.find_offset(ctx, id)? else {
            return Ok(None);
        };
        let entry = self.locate_entry(ctx, offset, None)?;
        let object_type = match entry.header.kind {
            EntryKind::Whole(ty) => ty,
            _ => self.object_type(ctx, offset)?,
        };
        Ok(Some(StoredRepresentation {
            offset,
            length: entry.end - offset,
            object_type,
            stored_size: entry.header.size,
            delta_base: entry.delta_base,
        }))
    }

    // --- raw access ---------------------------------------------------------

    fn block(&self, ctx: &ReadContext, position: u64) -> PackResult<Arc<Block>> {
        Ok(self.file.get_or_load_block(position, ctx.opener().as_ref())?)
    }

    /// Copy bytes at `position` into `buf`, stopping at end of file.
    fn read_at(&self, ctx: &ReadContext, position: u64, buf: &mut [u8]) -> PackResult<usize> {
        let mut n = 0;
        while n < buf.len() {
            let at = position + n as u64;
            if self.file.length().is_some_and(|len| at >= len) {
                break;
            }
            let copied = self.block(ctx, at)?.copy(at, &mut buf[n..]);
            if copied == 0 {
                break;
            }
            n += copied;
        }
        Ok(n)
    }

    fn read_entry_header(&self, ctx: &ReadContext, position: u64) -> PackResult<EntryHeader> {
        let mut buf = [0u8; MAX_ENTRY_HEADER];
        let n = self.read_at(ctx, position, &mut buf)?;
        parse_entry_header(&buf[..n], position).map_err(|e| match e {
            PackError::Format(reason) => self.corrupt_object(position, reason),
            other => other,
        })
    }

    /// Inflate exactly `size` bytes of the entry at `entry` whose zlib
    /// stream starts at `data_start`.
    fn inflate_entry(
        &self,
        ctx: &mut ReadContext,
        entry: u64,
        data_start: u64,
        size: u64,
    ) -> PackResult<Bytes> {
        if size > MAX_ARRAY_SIZE {
            return Err(PackError::LargeObjectExceedsLimit {
                offset: entry,
                size,
                limit: MAX_ARRAY_SIZE,
            });
        }
        let len = size as usize;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len + 1)
            .map_err(|_| PackError::LargeObjectOutOfMemory { offset: entry, size })?;
        // One spare byte catches streams longer than declared.
        buf.resize(len + 1, 0);
        let (filled, ended) = self.inflate_at(ctx, entry, data_start, &mut buf)?;
        if !ended || filled != len {
            return Err(self.corrupt_object(
                entry,
                format!("inflated size does not match declared {size} bytes"),
            ));
        }
        buf.truncate(len);
        ctx.stats.inflated_bytes += size;
        Ok(Bytes::from(buf))
    }

    /// Inflate from `position` until the stream ends or `buf` is full.
    fn inflate_at(
        &self,
        ctx: &mut ReadContext,
        entry: u64,
        mut position: u64,
        buf: &mut [u8],
    ) -> PackResult<(usize, bool)> {
        ctx.inflater.reset(true);
        let mut filled = 0;
        while filled < buf.len() {
            if self.file.length().is_some_and(|len| position >= len) {
                return Err(self.corrupt_object(entry, "compressed data runs past end of pack"));
            }
            let block = self.block(ctx, position)?;
            let input = block.remaining(position);
            let (in_before, out_before) = (ctx.inflater.total_in(), ctx.inflater.total_out());
            let status = ctx
                .inflater
                .decompress(input, &mut buf[filled..], FlushDecompress::None)
                .map_err(|e| self.corrupt_object(entry, format!("inflate failed: {e}")))?;
            let used = ctx.inflater.total_in() - in_before;
            let produced = (ctx.inflater.total_out() - out_before) as usize;
            position += used;
            filled += produced;
            if status == Status::StreamEnd {
                return Ok((filled, true));
            }
            if used == 0 && produced == 0 {
                return Err(self.corrupt_object(entry, "inflater made no progress"));
            }
        }
        Ok((filled, false))
    }

    fn crc32_range(&self, ctx: &ReadContext, start: u64, end: u64) -> PackResult<u32> {
        let mut hasher = crc32fast::Hasher::new();
        let mut pos = start;
        while pos < end {
            let n = self.block(ctx, pos)?.crc32(&mut hasher, pos, (end - pos) as usize);
            pos += n as u64;
        }
        Ok(hasher.finalize())
    }

    /// Length of the pack file, reading its first block if not yet known.
    fn pack_length(&self, ctx: &ReadContext) -> PackResult<u64> {
        if let Some(len) = self.file.length() {
            return Ok(len);
        }
        self.block(ctx, 0)?;
        self.file
            .length()
            .ok_or_else(|| PackError::Format(format!("length of {} unknown", self.file.file_name())))
    }

    /// Offset where entries end and the trailer begins.
    fn entries_end(&self, ctx: &ReadContext) -> PackResult<u64> {
        let len = self.pack_length(ctx)?;
        if len < PACK_HEADER_SIZE + PACK_TRAILER_SIZE {
            return Err(PackError::Format(format!("{} is too short", self.file.file_name())));
        }
        Ok(len - PACK_TRAILER_SIZE)
    }

    fn locate_entry(&self, ctx: &mut ReadContext, offset: u64, base: Option<ObjectId>) -> PackResult<AsIs> {
        let header = self.read_entry_header(ctx, offset)?;
        let rev = self.reverse_index(ctx)?;
        let end = rev.find_next_offset(offset, self.entries_end(ctx)?)?;
        let delta_base = match (header.kind, base) {
            (EntryKind::Whole(_), _) => None,
            (_, Some(base)) => Some(base),
            (EntryKind::RefDelta { base }, None) => Some(base),
            (EntryKind::OfsDelta { base_offset }, None) => Some(
                rev.find_object(base_offset)
                    .ok_or_else(|| self.corrupt_object(offset, "delta base is not an indexed object"))?,
            ),
        };
        Ok(AsIs {
            data_start: offset + header.header_len as u64,
            header,
            end,
            delta_base,
        })
    }

    // --- as-is copy ---------------------------------------------------------

    /// Copy the stored entry of `object` into `out` without inflating it.
    ///
    /// With `validate`, the entry is checked first against the index CRC32,
    /// or by inflating it when the index has none. Any failure before bytes
    /// reach `out` is reported as [`PackError::RepresentationUnavailable`].
    pub fn copy_as_is<W: Write>(
        &self,
        ctx: &mut ReadContext,
        out: &mut PackOutputStream<W>,
        object: &ObjectToPack,
        validate: bool,
    ) -> PackResult<()> {
        let entry = self
            .prepare_as_is(ctx, object, validate)
            .map_err(|e| PackError::RepresentationUnavailable(Box::new(e)))?;

        match (entry.header.kind, entry.delta_base) {
            (EntryKind::Whole(ty), _) => out.write_object_header(object.id, ty, entry.header.size)?,
            (_, Some(base)) => out.write_delta_header(object.id, &base, entry.header.size)?,
            (_, None) => {
                return Err(self.corrupt_object(object.offset, "delta entry without a base"));
            }
        }

        let mut pos = entry.data_start;
        while pos < entry.end {
            let n = self.block(ctx, pos)?.write_to(out, pos, (entry.end - pos) as usize)?;
            pos += n as u64;
        }
        ctx.stats.as_is_copies += 1;
        ctx.stats.as_is_bytes += entry.end - entry.data_start;
        Ok(())
    }

    fn prepare_as_is(&self, ctx: &mut ReadContext, object: &ObjectToPack, validate: bool) -> PackResult<AsIs> {
        if self.is_corrupt(object.offset) {
            return Err(self.corrupt_object(object.offset, "object previously marked corrupt"));
        }
        let entry = self.locate_entry(ctx, object.offset, object.delta_base)?;
        if !validate {
            return Ok(entry);
        }

        let idx = self.index(ctx)?;
        let checked = if idx.has_crc32() {
            let expected = idx.find_crc32(&object.id)?;
            let actual = self.crc32_range(ctx, object.offset, entry.end)?;
            if expected == actual {
                Ok(())
            } else {
                Err(self.corrupt_object(
                    object.offset,
                    format!("CRC32 {actual:08x} does not match index {expected:08x}"),
                ))
            }
        } else {
            self.inflate_entry(ctx, object.offset, entry.data_start, entry.header.size)
                .map(|_| ())
        };
        if let Err(err @ PackError::CorruptObject { .. }) = &checked {
            self.mark_corrupt(ctx, object.offset, err);
        }
        checked.map(|()| entry)
    }

    /// Copy every entry of the pack (no header, no trailer) into `out`.
    ///
    /// Small packs go through the block cache; packs too large for it are
    /// streamed from a fresh channel, reusing only blocks already cached.
    pub fn copy_pack_as_is(&self, ctx: &mut ReadContext, out: &mut dyn Write) -> PackResult<u64> {
        let end = self.entries_end(ctx)?;
        let length = end + PACK_TRAILER_SIZE;
        if self.file.cache().should_copy_through_cache(length) {
            let mut pos = PACK_HEADER_SIZE;
            while pos < end {
                let n = self.block(ctx, pos)?.write_to(out, pos, (end - pos) as usize)?;
                pos += n as u64;
            }
        } else {
            self.copy_bypassing_cache(ctx, out, end)?;
        }
        ctx.stats.as_is_bytes += end - PACK_HEADER_SIZE;
        Ok(end - PACK_HEADER_SIZE)
    }

    fn copy_bypassing_cache(&self, ctx: &ReadContext, out: &mut dyn Write, end: u64) -> PackResult<()> {
        let cache = self.file.cache();
        let block_size = u64::from(match self.file.block_size() {
            0 => cache.block_size(),
            n => n,
        });
        let mut rc = ctx.opener().open_file(self.desc(), PackExt::Pack)?;
        let read_ahead = match ctx.options().stream_pack_buffer_size {
            0 => block_size as usize,
            n => n,
        };
        rc.set_read_ahead_bytes(read_ahead)?;

        let mut buf = vec![0u8; block_size as usize];
        let mut pos = PACK_HEADER_SIZE;
        while pos < end {
            let aligned = pos - pos % block_size;
            if cache.contains(self.key(), aligned) {
                if let Some(block) = cache.get::<Block>(self.key(), aligned) {
                    if block.contains(self.key(), pos) {
                        pos += block.write_to(out, pos, (end - pos) as usize)? as u64;
                        continue;
                    }
                }
            }
            let want = (end - aligned).min(block_size) as usize;
            rc.set_position(aligned)?;
            let got = read_fully(rc.as_mut(), &mut buf[..want])?;
            let skip = (pos - aligned) as usize;
            if got <= skip {
                let reason = format!("{} ends at {}", self.file.file_name(), aligned + got as u64);
                self.file
                    .mark_invalid(Arc::new(io::Error::new(io::ErrorKind::UnexpectedEof, reason)));
                return Err(self.file.invalid_error().into());
            }
            out.write_all(&buf[skip..got])?;
            pos = aligned + got as u64;
        }
        Ok(())
    }
}

fn live<T>(slot: &Mutex<Option<CacheRef<T>>>) -> Option<Arc<T>> {
    slot.lock().as_ref().and_then(CacheRef::access)
}

impl std::fmt::Debug for PackFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackFile")
            .field("pack", &self.desc().pack_name)
            .field("file", &self.file)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Read;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use dfs_cache::{BlockCacheConfig, ByteChannel, FileOpener, ReadableChannel};
    use dfs_types::{PackSource, RepositoryDescription};

    use super::*;
    use crate::context::ReaderOptions;
    use crate::writer::{deflate, object_id, PackWriter, WrittenPack};

    const BLOCK: u32 = 512;

    #[derive(Default)]
    struct MemFiles {
        files: parking_lot::Mutex<HashMap<String, Bytes>>,
        opens: AtomicUsize,
    }

    impl MemFiles {
        fn put(&self, name: String, data: Vec<u8>) {
            self.files.lock().insert(name, Bytes::from(data));
        }
    }

    impl FileOpener for MemFiles {
        fn open_file(&self, desc: &PackDescription, ext: PackExt) -> io::Result<Box<dyn ReadableChannel>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            let name = desc.file_name(ext);
            match self.files.lock().get(&name) {
                Some(data) => Ok(Box::new(ByteChannel::new(data.clone()))),
                None => Err(io::Error::new(io::ErrorKind::NotFound, name)),
            }
        }
    }

    struct Fixture {
        files: Arc<MemFiles>,
        cache: Arc<BlockCache>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(BlockCacheConfig::default())
        }

        fn with_config(config: BlockCacheConfig) -> Self {
            let config = config.with_block_size(BLOCK).with_block_limit(1 << 20);
            Self {
                files: Arc::new(MemFiles::default()),
                cache: Arc::new(BlockCache::new(config).unwrap()),
            }
        }

        fn mount(&self, name: &str, written: &WrittenPack) -> Arc<PackFile> {
            let mut desc = PackDescription::new(RepositoryDescription::new("repo"), name, PackSource::Insert);
            written.describe(&mut desc);
            self.files.put(desc.file_name(PackExt::Pack), written.pack.clone());
            self.files.put(desc.file_name(PackExt::Index), written.index.clone());
            Arc::new(PackFile::new(Arc::clone(&self.cache), Arc::new(desc)))
        }

        fn ctx(&self) -> ReadContext {
            self.ctx_with(ReaderOptions::default())
        }

        fn ctx_with(&self, options: ReaderOptions) -> ReadContext {
            ReadContext::new(Arc::clone(&self.files) as Arc<dyn FileOpener>, options)
        }
    }

    fn noise(seed: u32, len: usize) -> Vec<u8> {
        let mut x = seed.wrapping_mul(2_654_435_761).wrapping_add(1);
        (0..len)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x as u8
            })
            .collect()
    }

    fn read_bytes(pack: &Arc<PackFile>, ctx: &mut ReadContext, id: &ObjectId) -> Vec<u8> {
        pack.get(ctx, id).unwrap().unwrap().into_bytes().unwrap().to_vec()
    }

    // --- deltas -------------------------------------------------------------------

    #[test]
    fn delta_chains_round_trip() {
        for depth in [0usize, 1, 5, 50] {
            let fx = Fixture::new();
            let mut versions = vec![noise(depth as u32, 3000)];
            for i in 1..=depth {
                let mut next = versions[i - 1].clone();
                let at = (i * 37) % next.len();
                next[at..at + 8].copy_from_slice(&(i as u64).to_be_bytes());
                next.extend_from_slice(format!("rev {i}").as_bytes());
                versions.push(next);
            }

            let mut writer = PackWriter::new();
            let mut ids = vec![writer.add_object(ObjectType::Blob, &versions[0])];
            for v in &versions[1..] {
                let base = *ids.last().unwrap();
                ids.push(writer.add_delta(&base, v).unwrap());
            }
            let written = writer.finish().unwrap();
            assert_eq!(written.delta_count, depth as u64);

            let pack = fx.mount("pack-chain", &written);
            let mut ctx = fx.ctx();
            for (id, expected) in ids.iter().zip(&versions).rev() {
                assert_eq!(&read_bytes(&pack, &mut ctx, id), expected, "depth {depth}");
                let offset = pack.find_offset(&mut ctx, id).unwrap().unwrap();
                assert_eq!(pack.object_size(&mut ctx, offset).unwrap(), expected.len() as u64);
                assert_eq!(pack.object_type(&mut ctx, offset).unwrap(), ObjectType::Blob);
            }
            assert!(ctx.stats().deltas_applied as usize >= depth);
        }
    }

    #[test]
    fn delta_base_cache_short_circuits_chain_walk() {
        let fx = Fixture::new();
        let base = noise(1, 2000);
        let mut target = base.clone();
        target.extend_from_slice(b"tail");
        let mut writer = PackWriter::new();
        let base_id = writer.add_object(ObjectType::Blob, &base);
        let delta_id = writer.add_delta(&base_id, &target).unwrap();
        let pack = fx.mount("pack-dbc", &writer.finish().unwrap());

        let mut ctx = fx.ctx();
        read_bytes(&pack, &mut ctx, &delta_id);
        assert_eq!(ctx.stats().delta_base_cache_hits, 0);
        assert_eq!(read_bytes(&pack, &mut ctx, &delta_id), target);
        assert_eq!(ctx.stats().delta_base_cache_hits, 1);
    }

    #[test]
    fn ref_delta_base_is_found_through_index() {
        let fx = Fixture::new();
        let base = noise(7, 1500);
        let mut target = base.clone();
        target[100] ^= 0xff;
        let mut writer = PackWriter::new();
        let base_id = writer.add_object(ObjectType::Tree, &base);
        let id = writer.add_ref_delta(&base_id, &target).unwrap();
        let pack = fx.mount("pack-ref", &writer.finish().unwrap());

        let mut ctx = fx.ctx();
        let loader = pack.get(&mut ctx, &id).unwrap().unwrap();
        assert_eq!(loader.object_type(), ObjectType::Tree);
        assert_eq!(loader.into_bytes().unwrap(), target);

        let rep = pack.representation(&mut ctx, &id).unwrap().unwrap();
        assert_eq!(rep.delta_base, Some(base_id));
        assert_eq!(rep.object_type, ObjectType::Tree);
    }

    #[test]
    fn oversized_delta_result_exceeds_limit() {
        let fx = Fixture::new();
        let base_id = object_id(ObjectType::Blob, b"abc");
        let delta_id = ObjectId::digest(b"huge");
        // base size 3, result size 3 GiB
        let delta = [3u8, 0x80, 0x80, 0x80, 0x80, 0x0c];

        let mut out = PackOutputStream::new(Vec::new());
        out.write_file_header(2).unwrap();
        out.write_object_header(base_id, ObjectType::Blob, 3).unwrap();
        out.write_all(&deflate(b"abc").unwrap()).unwrap();
        out.write_delta_header(delta_id, &base_id, delta.len() as u64).unwrap();
        out.write_all(&deflate(&delta).unwrap()).unwrap();
        let (pack, entries, checksum) = out.finish().unwrap();
        let written = WrittenPack::from_parts(pack, PackIndex::build(entries, checksum), 1);

        let pack = fx.mount("pack-huge", &written);
        let mut ctx = fx.ctx();
        match pack.get(&mut ctx, &delta_id) {
            Err(PackError::LargeObjectExceedsLimit { size, .. }) => assert_eq!(size, 3 << 30),
            other => panic!("expected LargeObjectExceedsLimit, got {other:?}"),
        }
        assert!(pack.has_object(&mut ctx, &delta_id).unwrap());
    }

    // --- corruption ---------------------------------------------------------------

    #[test]
    fn corrupt_offset_is_remembered_without_rereading() {
        let fx = Fixture::new();
        let data = noise(3, 4000);
        let mut writer = PackWriter::new();
        let id = writer.add_object(ObjectType::Blob, &data);
        let mut written = writer.finish().unwrap();
        let header = parse_entry_header(&written.pack[PACK_HEADER_SIZE as usize..], PACK_HEADER_SIZE).unwrap();
        let payload = PACK_HEADER_SIZE as usize + header.header_len;
        written.pack[payload..payload + 4].fill(0xff);

        let pack = fx.mount("pack-bad", &written);
        let mut ctx = fx.ctx();
        let offset = pack.find_offset(&mut ctx, &id).unwrap().unwrap();
        assert!(matches!(pack.load(&mut ctx, offset), Err(PackError::CorruptObject { .. })));
        assert!(pack.is_corrupt(offset));
        assert!(pack.is_invalid());
        assert_eq!(ctx.stats().corrupt_objects, 1);

        let before = fx.cache.stats();
        let opens = fx.files.opens.load(Ordering::SeqCst);
        for _ in 0..3 {
            assert!(matches!(pack.load(&mut ctx, offset), Err(PackError::CorruptObject { .. })));
        }
        assert!(!pack.has_object(&mut ctx, &id).unwrap());
        let after = fx.cache.stats();
        assert_eq!(after.total_hits(), before.total_hits());
        assert_eq!(after.total_misses(), before.total_misses());
        assert_eq!(fx.files.opens.load(Ordering::SeqCst), opens);
        assert_eq!(ctx.stats().corrupt_objects, 1);
    }

    #[test]
    fn truncated_pack_is_invalidated_on_short_read() {
        let fx = Fixture::new();
        let mut writer = PackWriter::new();
        writer.add_object(ObjectType::Blob, &noise(6, 600));
        let id = writer.add_object(ObjectType::Blob, &noise(7, 600));
        let written = writer.finish().unwrap();

        let pack = fx.mount("pack-cut", &written);
        let mut ctx = fx.ctx();
        let offset = pack.find_offset(&mut ctx, &id).unwrap().unwrap();
        assert!(offset >= u64::from(BLOCK) && offset < 2 * u64::from(BLOCK));
        // The description still claims the full length.
        fx.files.put("pack-cut.pack".to_string(), written.pack[..offset as usize + 10].to_vec());

        let first = pack.load(&mut ctx, offset).unwrap_err();
        assert!(
            matches!(first, PackError::Cache(dfs_cache::CacheError::ShortRead { .. })),
            "{first:?}"
        );
        assert!(pack.is_invalid());

        let opens = fx.files.opens.load(Ordering::SeqCst);
        let second = pack.load(&mut ctx, offset).unwrap_err();
        assert!(
            matches!(second, PackError::Cache(dfs_cache::CacheError::PackInvalid { .. })),
            "{second:?}"
        );
        assert_eq!(fx.files.opens.load(Ordering::SeqCst), opens);
    }

    #[test]
    fn index_load_failure_invalidates_pack() {
        let fx = Fixture::new();
        let mut writer = PackWriter::new();
        let id = writer.add_object(ObjectType::Blob, b"content");
        let mut written = writer.finish().unwrap();
        written.index = b"not an index".to_vec();

        let pack = fx.mount("pack-noidx", &written);
        let mut ctx = fx.ctx();
        assert!(matches!(
            pack.has_object(&mut ctx, &id),
            Err(PackError::Cache(dfs_cache::CacheError::PackInvalid { .. }))
        ));
        assert!(pack.is_invalid());
        assert!(matches!(
            pack.get(&mut ctx, &id),
            Err(PackError::Cache(dfs_cache::CacheError::PackInvalid { .. }))
        ));
    }

    // --- large objects ------------------------------------------------------------

    fn streaming_options() -> ReaderOptions {
        ReaderOptions {
            stream_file_threshold: 1024,
            ..ReaderOptions::default()
        }
    }

    #[test]
    fn large_whole_object_streams() {
        let fx = Fixture::new();
        let data = noise(11, 20_000);
        let mut writer = PackWriter::new();
        let id = writer.add_object(ObjectType::Blob, &data);
        let pack = fx.mount("pack-large", &writer.finish().unwrap());

        let mut ctx = fx.ctx_with(streaming_options());
        let loader = pack.get(&mut ctx, &id).unwrap().unwrap();
        assert!(loader.is_large());
        assert_eq!(loader.size(), 20_000);

        let mut content = Vec::new();
        loader.open_stream(&mut ctx).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, data);
        assert!(matches!(
            loader.into_bytes(),
            Err(PackError::LargeObjectExceedsLimit { limit: 1024, .. })
        ));
    }

    #[test]
    fn damaged_large_object_stream_invalidates_pack() {
        let fx = Fixture::new();
        let data = noise(13, 20_000);
        let mut writer = PackWriter::new();
        let id = writer.add_object(ObjectType::Blob, &data);
        let mut written = writer.finish().unwrap();
        let header = parse_entry_header(&written.pack[PACK_HEADER_SIZE as usize..], PACK_HEADER_SIZE).unwrap();
        written.pack[PACK_HEADER_SIZE as usize + header.header_len] = 0xff;
        let pack = fx.mount("pack-large-bad", &written);

        let mut ctx = fx.ctx_with(streaming_options());
        let offset = pack.find_offset(&mut ctx, &id).unwrap().unwrap();
        let loader = pack.load(&mut ctx, offset).unwrap();
        assert!(loader.is_large());
        assert!(!pack.is_invalid());

        let mut content = Vec::new();
        let err = loader.open_stream(&mut ctx).unwrap().read_to_end(&mut content).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData, "{err}");
        assert!(pack.is_invalid());
        assert!(matches!(
            pack.load(&mut ctx, offset),
            Err(PackError::Cache(dfs_cache::CacheError::PackInvalid { .. }))
        ));
    }

    #[test]
    fn large_object_reopens_from_another_pack() {
        let fx = Fixture::new();
        let data = noise(12, 8_000);
        let mut writer = PackWriter::new();
        let id = writer.add_object(ObjectType::Blob, &data);
        let written = writer.finish().unwrap();
        let first = fx.mount("pack-first", &written);
        let second = fx.mount("pack-second", &written);

        let opener = Arc::clone(&fx.files) as Arc<dyn FileOpener>;
        let replacement = Arc::clone(&second);
        let mut ctx = fx.ctx_with(streaming_options()).with_reopen(Arc::new(move |id: &ObjectId, _: ObjectType| {
            let mut ctx = ReadContext::new(Arc::clone(&opener), streaming_options());
            replacement.get(&mut ctx, id)?.ok_or(PackError::MissingObject(*id))
        }));

        let offset = first.find_offset(&mut ctx, &id).unwrap().unwrap();
        let loader = first.load(&mut ctx, offset).unwrap();
        first.file().mark_invalid(Arc::new(io::Error::other("pack removed")));

        let mut content = Vec::new();
        loader.open_stream(&mut ctx).unwrap().read_to_end(&mut content).unwrap();
        assert_eq!(content, data);
    }

    // --- as-is copy ---------------------------------------------------------------

    #[test]
    fn copy_as_is_produces_readable_pack() {
        let fx = Fixture::new();
        let base = noise(21, 2500);
        let mut target = base.clone();
        target.truncate(2000);
        let mut writer = PackWriter::new();
        let base_id = writer.add_object(ObjectType::Blob, &base);
        let delta_id = writer.add_delta(&base_id, &target).unwrap();
        let source = fx.mount("pack-src", &writer.finish().unwrap());

        let mut ctx = fx.ctx();
        let mut out = PackOutputStream::new(Vec::new());
        out.write_file_header(2).unwrap();
        for id in [base_id, delta_id] {
            let object = source.representation(&mut ctx, &id).unwrap().unwrap().to_object(id);
            source.copy_as_is(&mut ctx, &mut out, &object, true).unwrap();
        }
        let (pack, entries, checksum) = out.finish().unwrap();
        let copy = fx.mount("pack-copy", &WrittenPack::from_parts(pack, PackIndex::build(entries, checksum), 1));

        assert_eq!(read_bytes(&copy, &mut ctx, &base_id), base);
        assert_eq!(read_bytes(&copy, &mut ctx, &delta_id), target);
        assert_eq!(ctx.stats().as_is_copies, 2);
    }

    #[test]
    fn copy_as_is_rejects_crc_mismatch() {
        let fx = Fixture::new();
        let data = noise(5, 3000);
        let mut writer = PackWriter::new();
        let id = writer.add_object(ObjectType::Blob, &data);
        let mut written = writer.finish().unwrap();
        let last = written.pack.len() - 21;
        written.pack[last] ^= 0x01;
        let source = fx.mount("pack-crc", &written);

        let mut ctx = fx.ctx();
        let object = source.representation(&mut ctx, &id).unwrap().unwrap().to_object(id);
        let mut out = PackOutputStream::new(Vec::new());
        out.write_file_header(1).unwrap();
        let err = source.copy_as_is(&mut ctx, &mut out, &object, true).unwrap_err();
        assert!(matches!(err, PackError::RepresentationUnavailable(_)));
        assert!(source.is_corrupt(object.offset));
        assert!(source.is_invalid());
        assert_eq!(out.length(), PACK_HEADER_SIZE);
    }

    #[test]
    fn copy_pack_as_is_through_cache_and_around_it() {
        let mut writer = PackWriter::new();
        for i in 0..20u32 {
            writer.add_object(ObjectType::Blob, &noise(i, 700));
        }
        let written = writer.finish().unwrap();
        let body = written.pack[12..written.pack.len() - 20].to_vec();

        for ratio in [1.0, 0.0] {
            let fx = Fixture::with_config(BlockCacheConfig::default().with_stream_ratio(ratio));
            let pack = fx.mount("pack-whole", &written);
            let mut ctx = fx.ctx();
            let mut out = Vec::new();
            let n = pack.copy_pack_as_is(&mut ctx, &mut out).unwrap();
            assert_eq!(n as usize, body.len());
            assert_eq!(out, body, "stream ratio {ratio}");
        }
    }

    // --- indexes ------------------------------------------------------------------

    #[test]
    fn bitmap_index_is_loaded_when_present() {
        let fx = Fixture::new();
        let mut writer = PackWriter::new();
        let commit = writer.add_object(ObjectType::Commit, b"tree abc");
        writer.add_object(ObjectType::Blob, b"hello");
        let written = writer.finish().unwrap();
        let plain = fx.mount("pack-nobitmap", &written);

        let mut desc = (**plain.desc()).clone();
        desc.pack_name = "pack-bitmap".into();
        desc.add_file_ext(PackExt::BitmapIndex);
        fx.files.put(desc.file_name(PackExt::Pack), written.pack.clone());
        fx.files.put(desc.file_name(PackExt::Index), written.index.clone());

        let mut ctx = fx.ctx();
        assert!(plain.bitmap_index(&mut ctx).unwrap().is_none());

        let idx = plain.index(&mut ctx).unwrap();
        let rev = plain.reverse_index(&mut ctx).unwrap();
        let commit_bit = rev.pack_position(idx.find_offset(&commit).unwrap()).unwrap();
        let mut commits = crate::bitmap::Bitmap::new();
        commits.set(commit_bit);
        let mut all = crate::bitmap::Bitmap::new();
        all.set(0);
        all.set(1);
        let types = [commits.clone(), Default::default(), all.xor(&commits), Default::default()];
        let data = BitmapIndex::encode(
            idx.pack_checksum(),
            &types,
            &[(idx.find_position(&commit).unwrap() as u32, all.clone())],
        );
        fx.files.put(desc.file_name(PackExt::BitmapIndex), data);

        let pack = Arc::new(PackFile::new(Arc::clone(&fx.cache), Arc::new(desc)));
        let bitmaps = pack.bitmap_index(&mut ctx).unwrap().unwrap();
        assert_eq!(*bitmaps.bitmap_for(&commit, &idx).unwrap().unwrap(), all);
        assert_eq!(bitmaps.type_bitmap(ObjectType::Commit), &commits);
        assert_eq!(ctx.stats().bitmap_loads, 1);
        pack.bitmap_index(&mut ctx).unwrap();
        assert_eq!(ctx.stats().bitmap_loads, 1);
    }

    #[test]
    fn index_is_loaded_once_and_charged_to_cache() {
        let fx = Fixture::new();
        let mut writer = PackWriter::new();
        let ids: Vec<_> = (0..10u32).map(|i| writer.add_object(ObjectType::Blob, &noise(i, 50))).collect();
        let pack = fx.mount("pack-idx", &writer.finish().unwrap());

        let mut ctx = fx.ctx();
        for id in &ids {
            assert!(pack.has_object(&mut ctx, id).unwrap());
        }
        assert_eq!(ctx.stats().index_loads, 1);
        assert_eq!(fx.files.opens.load(Ordering::SeqCst), 1);
        assert_eq!(
            fx.cache.stats().live_bytes[PackExt::Index.position()],
            (10 * INDEX_BYTES_PER_OBJECT) as i64
        );
    }

    #[test]
    fn resolve_abbreviations() {
        let fx = Fixture::new();
        let mut writer = PackWriter::new();
        let ids: Vec<_> = (0..64u32).map(|i| writer.add_object(ObjectType::Blob, &noise(i, 10))).collect();
        let pack = fx.mount("pack-resolve", &writer.finish().unwrap());

        let mut ctx = fx.ctx();
        let prefix = AbbreviatedObjectId::from_hex(&ids[0].to_hex()[..8]).unwrap();
        let mut matches = BTreeSet::new();
        pack.resolve(&mut ctx, &mut matches, &prefix, 256).unwrap();
        assert_eq!(matches.into_iter().collect::<Vec<_>>(), vec![ids[0]]);
    }
}
