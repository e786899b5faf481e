//! Git pack file framing: the 12-byte file header and per-object entry
//! headers.
//!
//! ```text
//! file:   "PACK" | version u32 BE | object count u32 BE | entries... | 20-byte trailer
//! entry:  [1 byte: MSB continue | 3-bit type | 4 size bits] [7 size bits per byte]...
//!         OFS_DELTA: base distance, big-endian base-128 with +1 bias per byte
//!         REF_DELTA: 20-byte base object id
//!         zlib-compressed payload
//! ```

use dfs_types::{ObjectId, ObjectType, OBJECT_ID_LENGTH};

use crate::error::{PackError, PackResult};

pub const PACK_SIGNATURE: &[u8; 4] = b"PACK";
/// Signature, version and object count.
pub const PACK_HEADER_SIZE: u64 = 12;
/// Trailing checksum.
pub const PACK_TRAILER_SIZE: u64 = 20;

pub const OBJ_OFS_DELTA: u8 = 6;
pub const OBJ_REF_DELTA: u8 = 7;

/// Upper bound on the bytes needed to parse any entry header, including a
/// REF_DELTA base id.
pub const MAX_ENTRY_HEADER: usize = 32;

/// How the entry at an offset is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    Whole(ObjectType),
    OfsDelta { base_offset: u64 },
    RefDelta { base: ObjectId },
}

impl EntryKind {
    pub fn is_delta(&self) -> bool {
        !matches!(self, Self::Whole(_))
    }
}

/// A parsed entry header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EntryHeader {
    pub kind: EntryKind,
    /// Inflated size of the payload (for deltas, of the delta itself).
    pub size: u64,
    /// Bytes from the entry offset to the start of the zlib payload.
    pub header_len: usize,
}

/// Validate the pack file header and return the object count.
pub fn parse_pack_header(buf: &[u8]) -> PackResult<u32> {
    if buf.len() < PACK_HEADER_SIZE as usize {
        return Err(PackError::Format("pack header truncated".into()));
    }
    if &buf[0..4] != PACK_SIGNATURE {
        return Err(PackError::Format(format!(
            "bad pack signature {:02x?}",
            &buf[0..4]
        )));
    }
    let version = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if version != 2 && version != 3 {
        return Err(PackError::Format(format!(
            "unsupported pack version {version}"
        )));
    }
    Ok(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]))
}

pub fn write_pack_header(out: &mut Vec<u8>, object_count: u32) {
    out.extend_from_slice(PACK_SIGNATURE);
    out.extend_from_slice(&2u32.to_be_bytes());
    out.extend_from_slice(&object_count.to_be_bytes());
}

/// Parse the entry header at the start of `buf`, which was read from pack
/// offset `offset`.
pub fn parse_entry_header(buf: &[u8], offset: u64) -> PackResult<EntryHeader> {
    let mut pos = 0usize;
    let first = byte_at(buf, pos)?;
    pos += 1;

    let type_code = (first >> 4) & 0x07;
    let mut size = u64::from(first & 0x0f);
    let mut shift = 4u32;
    let mut c = first;
    while c & 0x80 != 0 {
        c = byte_at(buf, pos)?;
        pos += 1;
        if shift > 57 {
            return Err(PackError::Format("object size overflows 64 bits".into()));
        }
        size |= u64::from(c & 0x7f) << shift;
        shift += 7;
    }

    let kind = match type_code {
        OBJ_OFS_DELTA => {
            let mut c = byte_at(buf, pos)?;
            pos += 1;
            let mut distance = u64::from(c & 0x7f);
            while c & 0x80 != 0 {
                c = byte_at(buf, pos)?;
                pos += 1;
                distance = distance
                    .checked_add(1)
                    .and_then(|d| d.checked_mul(128))
                    .ok_or_else(|| PackError::Format("delta base distance overflows".into()))?;
                distance |= u64::from(c & 0x7f);
            }
            if distance == 0 || distance >= offset {
                return Err(PackError::Format(format!(
                    "delta base distance {distance} out of range"
                )));
            }
            EntryKind::OfsDelta {
                base_offset: offset - distance,
            }
        }
        OBJ_REF_DELTA => {
            let end = pos + OBJECT_ID_LENGTH;
            if buf.len() < end {
                return Err(PackError::Format("entry header truncated".into()));
            }
            let base = ObjectId::from_raw(&buf[pos..end])
                .map_err(|e| PackError::Format(e.to_string()))?;
            pos = end;
            EntryKind::RefDelta { base }
        }
        code => match ObjectType::from_type_code(code) {
            Some(ty) => EntryKind::Whole(ty),
            None => {
                return Err(PackError::UnknownObjectType {
                    type_code: code,
                    offset,
                })
            }
        },
    };

    Ok(EntryHeader {
        kind,
        size,
        header_len: pos,
    })
}

/// Append a type-and-size header.
pub fn encode_entry_header(out: &mut Vec<u8>, type_code: u8, mut size: u64) {
    let mut c = (type_code << 4) | (size & 0x0f) as u8;
    size >>= 4;
    while size != 0 {
        out.push(c | 0x80);
        c = (size & 0x7f) as u8;
        size >>= 7;
    }
    out.push(c);
}

/// Append the OFS_DELTA distance from a delta back to its base.
pub fn encode_ofs_distance(out: &mut Vec<u8>, mut distance: u64) {
    let mut buf = [0u8; 10];
    let mut n = buf.len() - 1;
    buf[n] = (distance & 0x7f) as u8;
    distance >>= 7;
    while distance != 0 {
        distance -= 1;
        n -= 1;
        buf[n] = 0x80 | (distance & 0x7f) as u8;
        distance >>= 7;
    }
    out.extend_from_slice(&buf[n..]);
}

fn byte_at(buf: &[u8], pos: usize) -> PackResult<u8> {
    buf.get(pos)
        .copied()
        .ok_or_else(|| PackError::Format("entry header truncated".into()))
}
