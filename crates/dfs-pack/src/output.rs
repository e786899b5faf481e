use std::collections::HashMap;
use std::io::{self, Write};

use dfs_types::{ObjectId, ObjectType, OBJECT_ID_LENGTH};

use crate::format::{encode_entry_header, encode_ofs_distance, write_pack_header, OBJ_OFS_DELTA, OBJ_REF_DELTA};
use crate::index::IndexEntry;

/// An object selected for copying into a new pack from an existing one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectToPack {
    pub id: ObjectId,
    pub object_type: ObjectType,
    /// Entry offset in the source pack.
    pub offset: u64,
    /// Set when the source entry is a delta.
    pub delta_base: Option<ObjectId>,
}

/// Writes a new pack, tracking where each object landed so later deltas
/// can refer back to their bases by offset.
///
/// Bytes written through [`Write`] belong to the object whose header was
/// written last.
pub struct PackOutputStream<W: Write> {
    out: W,
    count: u64,
    written: HashMap<ObjectId, u64>,
    entries: Vec<IndexEntry>,
    current: Option<(ObjectId, u64)>,
    crc: crc32fast::Hasher,
    digest: blake3::Hasher,
}

impl<W: Write> PackOutputStream<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            count: 0,
            written: HashMap::new(),
            entries: Vec::new(),
            current: None,
            crc: crc32fast::Hasher::new(),
            digest: blake3::Hasher::new(),
        }
    }

    /// Bytes written so far.
    pub fn length(&self) -> u64 {
        self.count
    }

    /// Offset of `id` in this pack, if already written.
    pub fn offset_of(&self, id: &ObjectId) -> Option<u64> {
        self.written.get(id).copied()
    }

    pub fn write_file_header(&mut self, object_count: u32) -> io::Result<()> {
        let mut buf = Vec::with_capacity(12);
        write_pack_header(&mut buf, object_count);
        self.write_all(&buf)
    }

    /// Start a whole object.
    pub fn write_object_header(&mut self, id: ObjectId, object_type: ObjectType, size: u64) -> io::Result<()> {
        self.begin(id);
        let mut buf = Vec::with_capacity(10);
        encode_entry_header(&mut buf, object_type.type_code(), size);
        self.write_all(&buf)
    }

    /// Start a delta of `size` bytes against `base`, by offset when the base
    /// is already in this pack and by id otherwise.
    pub fn write_delta_header(&mut self, id: ObjectId, base: &ObjectId, size: u64) -> io::Result<()> {
        let offset = self.begin(id);
        let mut buf = Vec::with_capacity(10 + OBJECT_ID_LENGTH);
        match self.offset_of(base) {
            Some(base_offset) if base_offset < offset => {
                encode_entry_header(&mut buf, OBJ_OFS_DELTA, size);
                encode_ofs_distance(&mut buf, offset - base_offset);
            }
            _ => {
                encode_entry_header(&mut buf, OBJ_REF_DELTA, size);
                buf.extend_from_slice(base.as_bytes());
            }
        }
        self.write_all(&buf)
    }

    /// Start a delta that always names its base by id.
    pub fn write_ref_delta_header(&mut self, id: ObjectId, base: &ObjectId, size: u64) -> io::Result<()> {
        self.begin(id);
        let mut buf = Vec::with_capacity(10 + OBJECT_ID_LENGTH);
        encode_entry_header(&mut buf, OBJ_REF_DELTA, size);
        buf.extend_from_slice(base.as_bytes());
        self.write_all(&buf)
    }

    /// Close the last object, append the trailer and return the sink with
    /// the index entries and pack checksum.
    pub fn finish(mut self) -> io::Result<(W, Vec<IndexEntry>, [u8; OBJECT_ID_LENGTH])> {
        self.end_object();
        let mut checksum = [0u8; OBJECT_ID_LENGTH];
        checksum.copy_from_slice(&self.digest.finalize().as_bytes()[..OBJECT_ID_LENGTH]);
        self.out.write_all(&checksum)?;
        self.out.flush()?;
        Ok((self.out, self.entries, checksum))
    }

    fn begin(&mut self, id: ObjectId) -> u64 {
        self.end_object();
        self.current = Some((id, self.count));
        self.written.insert(id, self.count);
        self.count
    }

    fn end_object(&mut self) {
        let crc = std::mem::take(&mut self.crc).finalize();
        if let Some((id, offset)) = self.current.take() {
            self.entries.push(IndexEntry {
                id,
                offset,
                crc32: crc,
            });
        }
    }
}

impl<W: Write> Write for PackOutputStream<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.out.write(buf)?;
        self.count += n as u64;
        self.crc.update(&buf[..n]);
        self.digest.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
