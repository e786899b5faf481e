use std::collections::HashMap;
use std::io::{self, Write};

use dfs_types::{ObjectId, ObjectType, PackDescription, PackExt, OBJECT_ID_LENGTH};
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::delta::DeltaEncoder;
use crate::error::{PackError, PackResult};
use crate::index::PackIndex;
use crate::output::PackOutputStream;

/// Id of an object: a digest over its canonical `"<type> <len>\0"` header
/// and content.
pub fn object_id(object_type: ObjectType, data: &[u8]) -> ObjectId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(object_type.name().as_bytes());
    hasher.update(format!(" {}\0", data.len()).as_bytes());
    hasher.update(data);
    let mut hash = [0u8; OBJECT_ID_LENGTH];
    hash.copy_from_slice(&hasher.finalize().as_bytes()[..OBJECT_ID_LENGTH]);
    ObjectId::from_hash(hash)
}

/// Zlib-compress `data` at the default level.
pub fn deflate(data: &[u8]) -> io::Result<Vec<u8>> {
    deflate_with(data, Compression::default())
}

fn deflate_with(data: &[u8], level: Compression) -> io::Result<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 16), level);
    enc.write_all(data)?;
    enc.finish()
}

/// Pack and index bytes produced by [`PackWriter::finish`].
#[derive(Clone, Debug)]
pub struct WrittenPack {
    pub pack: Vec<u8>,
    pub index: Vec<u8>,
    pub object_count: u64,
    pub delta_count: u64,
    pub checksum: [u8; OBJECT_ID_LENGTH],
}

impl WrittenPack {
    /// Assemble from pack bytes and a built index.
    pub fn from_parts(pack: Vec<u8>, index: PackIndex, delta_count: u64) -> Self {
        Self {
            pack,
            index: index.write_v2(),
            object_count: index.object_count() as u64,
            delta_count,
            checksum: *index.pack_checksum(),
        }
    }

    /// Record this pack's files and counts in `desc`.
    pub fn describe(&self, desc: &mut PackDescription) {
        desc.object_count = self.object_count;
        desc.delta_count = self.delta_count;
        desc.index_version = 2;
        desc.add_file_ext(PackExt::Pack)
            .add_file_ext(PackExt::Index)
            .set_file_size(PackExt::Pack, self.pack.len() as u64)
            .set_file_size(PackExt::Index, self.index.len() as u64);
    }
}

enum Queued {
    Whole(ObjectId),
    Delta { id: ObjectId, base: ObjectId, by_ref: bool },
}

/// Builds a pack in memory from whole objects and deltas.
pub struct PackWriter {
    queued: Vec<Queued>,
    objects: HashMap<ObjectId, (ObjectType, Vec<u8>)>,
    compression: Compression,
}

impl Default for PackWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PackWriter {
    pub fn new() -> Self {
        Self {
            queued: Vec::new(),
            objects: HashMap::new(),
            compression: Compression::default(),
        }
    }

    /// Use zlib level `level` (0-9).
    pub fn with_compression(mut self, level: u32) -> Self {
        self.compression = Compression::new(level.min(9));
        self
    }

    /// Queue a whole object. Adding the same content twice is a no-op.
    pub fn add_object(&mut self, object_type: ObjectType, data: &[u8]) -> ObjectId {
        let id = object_id(object_type, data);
        if !self.objects.contains_key(&id) {
            self.objects.insert(id, (object_type, data.to_vec()));
            self.queued.push(Queued::Whole(id));
        }
        id
    }

    /// Queue `data` stored as a delta against the already queued `base`.
    pub fn add_delta(&mut self, base: &ObjectId, data: &[u8]) -> PackResult<ObjectId> {
        self.queue_delta(base, data, false)
    }

    /// Like [`add_delta`](Self::add_delta), but the entry names its base by
    /// id even though the base is in the same pack.
    pub fn add_ref_delta(&mut self, base: &ObjectId, data: &[u8]) -> PackResult<ObjectId> {
        self.queue_delta(base, data, true)
    }

    fn queue_delta(&mut self, base: &ObjectId, data: &[u8], by_ref: bool) -> PackResult<ObjectId> {
        let object_type = match self.objects.get(base) {
            Some((ty, _)) => *ty,
            None => return Err(PackError::MissingObject(*base)),
        };
        let id = object_id(object_type, data);
        if !self.objects.contains_key(&id) {
            self.objects.insert(id, (object_type, data.to_vec()));
            self.queued.push(Queued::Delta { id, base: *base, by_ref });
        }
        Ok(id)
    }

    /// Number of objects queued.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Encode the queued objects, in order, into a pack and its v2 index.
    pub fn finish(self) -> PackResult<WrittenPack> {
        let mut out = PackOutputStream::new(Vec::new());
        out.write_file_header(self.queued.len() as u32)?;

        let mut delta_count = 0;
        for queued in &self.queued {
            match *queued {
                Queued::Whole(id) => {
                    let (ty, data) = &self.objects[&id];
                    out.write_object_header(id, *ty, data.len() as u64)?;
                    out.write_all(&deflate_with(data, self.compression)?)?;
                }
                Queued::Delta { id, base, by_ref } => {
                    let (_, base_data) = &self.objects[&base];
                    let (_, data) = &self.objects[&id];
                    let delta = DeltaEncoder::new(base_data).encode(data);
                    if by_ref {
                        out.write_ref_delta_header(id, &base, delta.len() as u64)?;
                    } else {
                        out.write_delta_header(id, &base, delta.len() as u64)?;
                    }
                    out.write_all(&deflate_with(&delta, self.compression)?)?;
                    delta_count += 1;
                }
            }
        }

        let (pack, entries, checksum) = out.finish()?;
        Ok(WrittenPack::from_parts(pack, PackIndex::build(entries, checksum), delta_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{parse_entry_header, parse_pack_header, EntryKind, PACK_HEADER_SIZE};

    #[test]
    fn object_id_depends_on_type() {
        assert_ne!(object_id(ObjectType::Blob, b"x"), object_id(ObjectType::Tree, b"x"));
        assert_eq!(object_id(ObjectType::Blob, b"x"), object_id(ObjectType::Blob, b"x"));
    }

    #[test]
    fn duplicate_objects_are_written_once() {
        let mut writer = PackWriter::new();
        let a = writer.add_object(ObjectType::Blob, b"same");
        let b = writer.add_object(ObjectType::Blob, b"same");
        assert_eq!(a, b);
        assert_eq!(writer.len(), 1);
    }

    #[test]
    fn delta_needs_queued_base() {
        let mut writer = PackWriter::new();
        let missing = ObjectId::digest(b"nope");
        assert!(matches!(writer.add_delta(&missing, b"data"), Err(PackError::MissingObject(_))));
    }

    #[test]
    fn finish_writes_header_entries_and_index() {
        let mut writer = PackWriter::new();
        let base = writer.add_object(ObjectType::Blob, b"hello world, hello pack");
        let delta = writer.add_delta(&base, b"hello world, hello packs").unwrap();
        let by_ref = writer.add_ref_delta(&base, b"hello world!").unwrap();
        let written = writer.finish().unwrap();

        assert_eq!(parse_pack_header(&written.pack).unwrap(), 3);
        assert_eq!(written.object_count, 3);
        assert_eq!(written.delta_count, 2);
        assert_eq!(&written.pack[written.pack.len() - OBJECT_ID_LENGTH..], &written.checksum);

        let index = PackIndex::parse(&written.index).unwrap();
        assert_eq!(index.find_offset(&base), Some(PACK_HEADER_SIZE));
        let at = index.find_offset(&delta).unwrap();
        let header = parse_entry_header(&written.pack[at as usize..], at).unwrap();
        assert_eq!(header.kind, EntryKind::OfsDelta { base_offset: PACK_HEADER_SIZE });
        let at = index.find_offset(&by_ref).unwrap();
        let header = parse_entry_header(&written.pack[at as usize..], at).unwrap();
        assert_eq!(header.kind, EntryKind::RefDelta { base });
    }

    #[test]
    fn describe_fills_pack_description() {
        let mut writer = PackWriter::new();
        writer.add_object(ObjectType::Commit, b"tree 0");
        let written = writer.finish().unwrap();
        let mut desc = PackDescription::new(
            dfs_types::RepositoryDescription::new("r"),
            "pack-1",
            dfs_types::PackSource::Insert,
        );
        written.describe(&mut desc);
        assert!(desc.has_file_ext(PackExt::Pack));
        assert!(desc.has_file_ext(PackExt::Index));
        assert_eq!(desc.file_size(PackExt::Pack), written.pack.len() as u64);
        assert_eq!(desc.object_count, 1);
    }
}
