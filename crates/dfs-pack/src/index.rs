use std::collections::BTreeSet;

use dfs_types::{AbbreviatedObjectId, ObjectId, OBJECT_ID_LENGTH};

use crate::error::{PackError, PackResult};

/// Magic prefix of version 2+ index files.
pub const INDEX_V2_MAGIC: [u8; 4] = [0xff, b't', b'O', b'c'];

const FANOUT_ENTRIES: usize = 256;
const FANOUT_BYTES: usize = FANOUT_ENTRIES * 4;
const TRAILER_BYTES: usize = 2 * OBJECT_ID_LENGTH;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// Estimated in-memory bytes per object of a parsed index.
pub const INDEX_BYTES_PER_OBJECT: usize = 28;

/// One object recorded in an index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub id: ObjectId,
    pub offset: u64,
    pub crc32: u32,
}

/// Parsed Git pack index (`.idx`), versions 1 and 2.
///
/// Layout of version 2:
/// - magic `\377tOc`, version 2
/// - fan-out table: 256 entries counting objects with first byte <= index
/// - sorted object ids
/// - CRC32 of each packed entry (parallel)
/// - 31-bit offsets; MSB set means "index into the 64-bit offset table"
/// - 64-bit offsets
/// - pack checksum, index checksum
///
/// Version 1 has no magic or CRCs and stores `(offset u32, id)` pairs
/// after the fan-out.
#[derive(Clone, Debug)]
pub struct PackIndex {
    version: u32,
    fan_out: [u32; FANOUT_ENTRIES],
    ids: Vec<ObjectId>,
    offsets: Vec<u64>,
    crc32s: Option<Vec<u32>>,
    pack_checksum: [u8; OBJECT_ID_LENGTH],
}

impl PackIndex {
    /// Build a version 2 index from entries in any order.
    pub fn build(mut entries: Vec<IndexEntry>, pack_checksum: [u8; OBJECT_ID_LENGTH]) -> Self {
        entries.sort_by(|a, b| a.id.cmp(&b.id));

        let mut fan_out = [0u32; FANOUT_ENTRIES];
        for e in &entries {
            fan_out[usize::from(e.id.first_byte())] += 1;
        }
        for i in 1..FANOUT_ENTRIES {
            fan_out[i] += fan_out[i - 1];
        }

        Self {
            version: 2,
            fan_out,
            ids: entries.iter().map(|e| e.id).collect(),
            offsets: entries.iter().map(|e| e.offset).collect(),
            crc32s: Some(entries.iter().map(|e| e.crc32).collect()),
            pack_checksum,
        }
    }

    /// Parse an index file.
    pub fn parse(data: &[u8]) -> PackResult<Self> {
        if data.len() >= 8 && data[0..4] == INDEX_V2_MAGIC {
            let version = be_u32(data, 4)?;
            if version != 2 {
                return Err(PackError::Index(format!("unsupported index version {version}")));
            }
            Self::parse_v2(data)
        } else {
            Self::parse_v1(data)
        }
    }

    fn parse_v1(data: &[u8]) -> PackResult<Self> {
        let fan_out = read_fan_out(data, 0)?;
        let count = fan_out[FANOUT_ENTRIES - 1] as usize;
        let record = 4 + OBJECT_ID_LENGTH;
        let records_end = FANOUT_BYTES + count * record;
        if data.len() < records_end + TRAILER_BYTES {
            return Err(PackError::Index("index truncated".into()));
        }

        let mut ids = Vec::with_capacity(count);
        let mut offsets = Vec::with_capacity(count);
        for n in 0..count {
            let at = FANOUT_BYTES + n * record;
            offsets.push(u64::from(be_u32(data, at)?));
            ids.push(id_at(data, at + 4)?);
        }

        Ok(Self {
            version: 1,
            fan_out,
            ids,
            offsets,
            crc32s: None,
            pack_checksum: checksum_at(data, records_end)?,
        })
    }

    fn parse_v2(data: &[u8]) -> PackResult<Self> {
        let fan_out = read_fan_out(data, 8)?;
        let count = fan_out[FANOUT_ENTRIES - 1] as usize;

        let ids_at = 8 + FANOUT_BYTES;
        let crcs_at = ids_at + count * OBJECT_ID_LENGTH;
        let offsets_at = crcs_at + count * 4;
        let large_at = offsets_at + count * 4;
        if data.len() < large_at + TRAILER_BYTES {
            return Err(PackError::Index("index truncated".into()));
        }
        let large_count = (data.len() - large_at - TRAILER_BYTES) / 8;

        let mut ids = Vec::with_capacity(count);
        let mut crc32s = Vec::with_capacity(count);
        let mut offsets = Vec::with_capacity(count);
        for n in 0..count {
            ids.push(id_at(data, ids_at + n * OBJECT_ID_LENGTH)?);
            crc32s.push(be_u32(data, crcs_at + n * 4)?);
            let small = be_u32(data, offsets_at + n * 4)?;
            let offset = if small & LARGE_OFFSET_FLAG != 0 {
                let slot = (small & !LARGE_OFFSET_FLAG) as usize;
                if slot >= large_count {
                    return Err(PackError::Index(format!(
                        "64-bit offset slot {slot} out of range"
                    )));
                }
                be_u64(data, large_at + slot * 8)?
            } else {
                u64::from(small)
            };
            offsets.push(offset);
        }

        Ok(Self {
            version: 2,
            fan_out,
            ids,
            offsets,
            crc32s: Some(crc32s),
            pack_checksum: checksum_at(data, large_at + large_count * 8)?,
        })
    }

    /// Serialize in version 2 format.
    pub fn write_v2(&self) -> Vec<u8> {
        let count = self.ids.len();
        let mut buf = Vec::with_capacity(8 + FANOUT_BYTES + count * 28 + TRAILER_BYTES);
        buf.extend_from_slice(&INDEX_V2_MAGIC);
        buf.extend_from_slice(&2u32.to_be_bytes());
        for c in &self.fan_out {
            buf.extend_from_slice(&c.to_be_bytes());
        }
        for id in &self.ids {
            buf.extend_from_slice(id.as_bytes());
        }
        for n in 0..count {
            buf.extend_from_slice(&self.crc32_at(n).unwrap_or(0).to_be_bytes());
        }
        let mut large = Vec::new();
        for &offset in &self.offsets {
            if offset < u64::from(LARGE_OFFSET_FLAG) {
                buf.extend_from_slice(&(offset as u32).to_be_bytes());
            } else {
                let slot = large.len() as u32 | LARGE_OFFSET_FLAG;
                buf.extend_from_slice(&slot.to_be_bytes());
                large.push(offset);
            }
        }
        for offset in large {
            buf.extend_from_slice(&offset.to_be_bytes());
        }
        buf.extend_from_slice(&self.pack_checksum);
        let digest = blake3::hash(&buf);
        buf.extend_from_slice(&digest.as_bytes()[..OBJECT_ID_LENGTH]);
        buf
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn object_count(&self) -> usize {
        self.ids.len()
    }

    /// True if the index records a CRC32 per entry (version 2).
    pub fn has_crc32(&self) -> bool {
        self.crc32s.is_some()
    }

    pub fn pack_checksum(&self) -> &[u8; OBJECT_ID_LENGTH] {
        &self.pack_checksum
    }

    /// Position of `id` in sorted order.
    pub fn find_position(&self, id: &ObjectId) -> Option<usize> {
        let (lo, hi) = self.bucket(id.first_byte());
        self.ids[lo..hi].binary_search(id).ok().map(|p| lo + p)
    }

    /// Pack offset of `id`.
    pub fn find_offset(&self, id: &ObjectId) -> Option<u64> {
        self.find_position(id).map(|n| self.offsets[n])
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.find_position(id).is_some()
    }

    /// CRC32 of the packed entry for `id`.
    pub fn find_crc32(&self, id: &ObjectId) -> PackResult<u32> {
        let n = self
            .find_position(id)
            .ok_or(PackError::MissingObject(*id))?;
        self.crc32_at(n)
            .ok_or_else(|| PackError::Index(format!("version {} index has no CRC32", self.version)))
    }

    pub fn id_at(&self, n: usize) -> Option<ObjectId> {
        self.ids.get(n).copied()
    }

    pub fn offset_at(&self, n: usize) -> Option<u64> {
        self.offsets.get(n).copied()
    }

    pub fn crc32_at(&self, n: usize) -> Option<u32> {
        self.crc32s.as_ref().and_then(|c| c.get(n).copied())
    }

    /// Entries in object id order.
    pub fn entries(&self) -> impl Iterator<Item = IndexEntry> + '_ {
        (0..self.ids.len()).map(|n| IndexEntry {
            id: self.ids[n],
            offset: self.offsets[n],
            crc32: self.crc32_at(n).unwrap_or(0),
        })
    }

    /// Add ids starting with `prefix` to `matches` until it holds `limit`.
    pub fn resolve(&self, matches: &mut BTreeSet<ObjectId>, prefix: &AbbreviatedObjectId, limit: usize) {
        let (lo, hi) = if prefix.len() >= 2 {
            self.bucket(prefix.first_byte())
        } else {
            (0, self.ids.len())
        };
        let ids = &self.ids[lo..hi];
        let start = ids.partition_point(|id| prefix.prefix_compare(id).is_gt());
        for id in &ids[start..] {
            if matches.len() >= limit || !prefix.is_prefix_of(id) {
                break;
            }
            matches.insert(*id);
        }
    }

    fn bucket(&self, first: u8) -> (usize, usize) {
        let b = usize::from(first);
        let lo = if b == 0 { 0 } else { self.fan_out[b - 1] as usize };
        (lo, self.fan_out[b] as usize)
    }
}

fn read_fan_out(data: &[u8], at: usize) -> PackResult<[u32; FANOUT_ENTRIES]> {
    let mut fan_out = [0u32; FANOUT_ENTRIES];
    let mut prev = 0;
    for (i, slot) in fan_out.iter_mut().enumerate() {
        *slot = be_u32(data, at + i * 4)?;
        if *slot < prev {
            return Err(PackError::Index(format!("fan-out decreases at entry {i}")));
        }
        prev = *slot;
    }
    Ok(fan_out)
}

fn be_u32(data: &[u8], at: usize) -> PackResult<u32> {
    data.get(at..at + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| PackError::Index("index truncated".into()))
}

fn be_u64(data: &[u8], at: usize) -> PackResult<u64> {
    let hi = be_u32(data, at)?;
    let lo = be_u32(data, at + 4)?;
    Ok((u64::from(hi) << 32) | u64::from(lo))
}

fn id_at(data: &[u8], at: usize) -> PackResult<ObjectId> {
    data.get(at..at + OBJECT_ID_LENGTH)
        .ok_or_else(|| PackError::Index("index truncated".into()))
        .and_then(|raw| ObjectId::from_raw(raw).map_err(|e| PackError::Index(e.to_string())))
}

fn checksum_at(data: &[u8], at: usize) -> PackResult<[u8; OBJECT_ID_LENGTH]> {
    let raw = data
        .get(at..at + OBJECT_ID_LENGTH)
        .ok_or_else(|| PackError::Index("index truncated".into()))?;
    let mut sum = [0u8; OBJECT_ID_LENGTH];
    sum.copy_from_slice(raw);
    Ok(sum)
}
