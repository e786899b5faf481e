//! Pack bitmap index (`.bitmap`, version 1).
//!
//! ```text
//! "BITM" | version u16 | flags u16 | entry count u32 | pack checksum (20)
//! commits, trees, blobs, tags        4 EWAH type bitmaps
//! entries: idx position u32 | xor offset u8 | flags u8 | EWAH
//! [name-hash cache: u32 per object, when flagged]
//! trailer (20)
//! ```
//!
//! Bit `n` of every bitmap is the `n`th object in pack order. An entry with a
//! non-zero XOR offset `k` stores its bitmap XORed with the entry `k` places
//! before it; entries are resolved on first use.

use std::collections::HashMap;
use std::sync::Arc;

use dfs_types::{ObjectId, ObjectType, OBJECT_ID_LENGTH};
use parking_lot::Mutex;

use crate::error::{PackError, PackResult};
use crate::index::PackIndex;
use crate::reverse_index::ReverseIndex;

pub const BITMAP_SIGNATURE: &[u8; 4] = b"BITM";
pub const BITMAP_VERSION: u16 = 1;

/// Bitmaps cover the full reachable graph of each commit.
pub const BITMAP_OPT_FULL_DAG: u16 = 0x1;
/// A name-hash cache follows the entries.
pub const BITMAP_OPT_HASH_CACHE: u16 = 0x4;

const HEADER_SIZE: usize = 12 + OBJECT_ID_LENGTH;
const MAX_XOR_OFFSET: usize = 160;

const RUN_BITS: u32 = 32;
const LITERAL_BITS: u32 = 31;
const MAX_RUN: u64 = (1 << RUN_BITS) - 1;
const MAX_LITERALS: u64 = (1 << LITERAL_BITS) - 1;

/// Uncompressed bitset with trailing zero words trimmed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
}

impl Bitmap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_words(words: Vec<u64>) -> Self {
        let mut b = Self { words };
        b.trim();
        b
    }

    pub fn get(&self, bit: usize) -> bool {
        self.words
            .get(bit / 64)
            .is_some_and(|w| w & (1 << (bit % 64)) != 0)
    }

    pub fn set(&mut self, bit: usize) {
        let word = bit / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (bit % 64);
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn cardinality(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// One past the highest set bit.
    pub fn bit_len(&self) -> usize {
        match self.words.last() {
            Some(&last) => self.words.len() * 64 - last.leading_zeros() as usize,
            None => 0,
        }
    }

    pub fn xor(&self, other: &Bitmap) -> Bitmap {
        self.zip_with(other, |a, b| a ^ b)
    }

    pub fn or(&self, other: &Bitmap) -> Bitmap {
        self.zip_with(other, |a, b| a | b)
    }

    pub fn and(&self, other: &Bitmap) -> Bitmap {
        self.zip_with(other, |a, b| a & b)
    }

    /// Set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros() as usize;
                w &= w - 1;
                Some(i * 64 + bit)
            })
        })
    }

    fn zip_with(&self, other: &Bitmap, f: impl Fn(u64, u64) -> u64) -> Bitmap {
        let len = self.words.len().max(other.words.len());
        let word = |b: &Bitmap, i: usize| b.words.get(i).copied().unwrap_or(0);
        Bitmap::from_words((0..len).map(|i| f(word(self, i), word(other, i))).collect())
    }

    fn trim(&mut self) {
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }
}

/// EWAH-compressed bitmap as stored on disk.
///
/// A run-length word (RLW) holds the running bit in bit 0, a count of
/// uniform words in bits 1..33 and a count of literal words that follow it
/// in bits 33..64.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EwahBitmap {
    bit_size: u32,
    words: Vec<u64>,
    last_rlw: u32,
}

impl EwahBitmap {
    /// Compress `bitmap`.
    pub fn compress(bitmap: &Bitmap) -> Self {
        let src = &bitmap.words;
        let mut words = Vec::new();
        let mut last_rlw;
        let mut i = 0;
        loop {
            last_rlw = words.len();
            words.push(0);
            let mut running_bit = 0u64;
            let mut run = 0u64;
            if let Some(&w) = src.get(i) {
                if w == 0 || w == u64::MAX {
                    running_bit = u64::from(w == u64::MAX);
                    while run < MAX_RUN && src.get(i) == Some(&w) {
                        run += 1;
                        i += 1;
                    }
                }
            }
            let mut literals = 0u64;
            while literals < MAX_LITERALS {
                match src.get(i) {
                    Some(&w) if w != 0 && w != u64::MAX => {
                        words.push(w);
                        literals += 1;
                        i += 1;
                    }
                    _ => break,
                }
            }
            words[last_rlw] = running_bit | (run << 1) | (literals << 33);
            if i >= src.len() {
                break;
            }
        }
        Self {
            bit_size: bitmap.bit_len() as u32,
            words,
            last_rlw: last_rlw as u32,
        }
    }

    /// Expand into an uncompressed bitmap.
    pub fn decompress(&self) -> PackResult<Bitmap> {
        let expected = (self.bit_size as usize).div_ceil(64);
        let mut out = Vec::with_capacity(expected);
        let mut i = 0;
        while i < self.words.len() {
            let rlw = self.words[i];
            i += 1;
            let fill = if rlw & 1 != 0 { u64::MAX } else { 0 };
            let run = ((rlw >> 1) & MAX_RUN) as usize;
            let literals = (rlw >> 33) as usize;
            if out.len() + run + literals > expected {
                return Err(PackError::Format("EWAH bitmap longer than its bit size".into()));
            }
            out.resize(out.len() + run, fill);
            let end = i + literals;
            let lit = self
                .words
                .get(i..end)
                .ok_or_else(|| PackError::Format("EWAH literal words truncated".into()))?;
            out.extend_from_slice(lit);
            i = end;
        }
        Ok(Bitmap::from_words(out))
    }

    /// Bytes this bitmap occupies when serialized.
    pub fn serialized_len(&self) -> usize {
        12 + self.words.len() * 8
    }

    fn parse(data: &[u8], pos: &mut usize) -> PackResult<Self> {
        let bit_size = be_u32(data, pos)?;
        let count = be_u32(data, pos)? as usize;
        let end = pos
            .checked_add(count * 8)
            .filter(|&end| end <= data.len())
            .ok_or_else(|| PackError::Format("EWAH bitmap truncated".into()))?;
        let words = data[*pos..end]
            .chunks_exact(8)
            .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect();
        *pos = end;
        let last_rlw = be_u32(data, pos)?;
        Ok(Self {
            bit_size,
            words,
            last_rlw,
        })
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.bit_size.to_be_bytes());
        out.extend_from_slice(&(self.words.len() as u32).to_be_bytes());
        for w in &self.words {
            out.extend_from_slice(&w.to_be_bytes());
        }
        out.extend_from_slice(&self.last_rlw.to_be_bytes());
    }
}

#[derive(Debug)]
struct StoredEntry {
    index_position: u32,
    xor_offset: u8,
    flags: u8,
    bitmap: EwahBitmap,
}

/// Parsed bitmap index for one pack.
#[derive(Debug)]
pub struct BitmapIndex {
    flags: u16,
    pack_checksum: [u8; OBJECT_ID_LENGTH],
    /// Commits, trees, blobs, tags.
    types: [Bitmap; 4],
    entries: Vec<StoredEntry>,
    by_position: HashMap<u32, usize>,
    resolved: Mutex<HashMap<usize, Arc<Bitmap>>>,
}

impl BitmapIndex {
    pub fn parse(data: &[u8]) -> PackResult<Self> {
        if data.len() < HEADER_SIZE || &data[0..4] != BITMAP_SIGNATURE {
            return Err(PackError::Format("bad bitmap index signature".into()));
        }
        let version = u16::from_be_bytes([data[4], data[5]]);
        if version != BITMAP_VERSION {
            return Err(PackError::Format(format!("unsupported bitmap version {version}")));
        }
        let flags = u16::from_be_bytes([data[6], data[7]]);
        let mut pos = 8;
        let count = be_u32(data, &mut pos)? as usize;
        let mut pack_checksum = [0u8; OBJECT_ID_LENGTH];
        pack_checksum.copy_from_slice(&data[pos..pos + OBJECT_ID_LENGTH]);
        pos += OBJECT_ID_LENGTH;

        let mut types: [Bitmap; 4] = Default::default();
        for t in &mut types {
            *t = EwahBitmap::parse(data, &mut pos)?.decompress()?;
        }

        let mut entries = Vec::with_capacity(count.min(data.len() / 18));
        let mut by_position = HashMap::with_capacity(entries.capacity());
        for n in 0..count {
            let index_position = be_u32(data, &mut pos)?;
            let header = data
                .get(pos..pos + 2)
                .ok_or_else(|| PackError::Format("bitmap entry truncated".into()))?;
            let (xor_offset, flags) = (header[0], header[1]);
            pos += 2;
            if usize::from(xor_offset) > n || usize::from(xor_offset) > MAX_XOR_OFFSET {
                return Err(PackError::Format(format!(
                    "bitmap entry {n} has invalid XOR offset {xor_offset}"
                )));
            }
            let bitmap = EwahBitmap::parse(data, &mut pos)?;
            by_position.insert(index_position, entries.len());
            entries.push(StoredEntry {
                index_position,
                xor_offset,
                flags,
                bitmap,
            });
        }

        Ok(Self {
            flags,
            pack_checksum,
            types,
            entries,
            by_position,
            resolved: Mutex::new(HashMap::new()),
        })
    }

    /// Serialize type bitmaps and commit bitmaps keyed by idx position.
    ///
    /// Each entry is stored XORed against the previous one unless that
    /// compresses worse.
    pub fn encode(
        pack_checksum: &[u8; OBJECT_ID_LENGTH],
        types: &[Bitmap; 4],
        entries: &[(u32, Bitmap)],
    ) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(BITMAP_SIGNATURE);
        out.extend_from_slice(&BITMAP_VERSION.to_be_bytes());
        out.extend_from_slice(&BITMAP_OPT_FULL_DAG.to_be_bytes());
        out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        out.extend_from_slice(pack_checksum);
        for t in types {
            EwahBitmap::compress(t).write(&mut out);
        }
        for (n, (position, bitmap)) in entries.iter().enumerate() {
            let plain = EwahBitmap::compress(bitmap);
            let xored = (n > 0).then(|| EwahBitmap::compress(&bitmap.xor(&entries[n - 1].1)));
            let (xor_offset, stored) = match xored {
                Some(x) if x.words.len() <= plain.words.len() => (1u8, x),
                _ => (0u8, plain),
            };
            out.extend_from_slice(&position.to_be_bytes());
            out.push(xor_offset);
            out.push(0);
            stored.write(&mut out);
        }
        out.extend_from_slice(&blake3::hash(&out).as_bytes()[..OBJECT_ID_LENGTH]);
        out
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn pack_checksum(&self) -> &[u8; OBJECT_ID_LENGTH] {
        &self.pack_checksum
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Objects of type `ty`, in pack order.
    pub fn type_bitmap(&self, ty: ObjectType) -> &Bitmap {
        match ty {
            ObjectType::Commit => &self.types[0],
            ObjectType::Tree => &self.types[1],
            ObjectType::Blob => &self.types[2],
            ObjectType::Tag => &self.types[3],
        }
    }

    /// Reachability bitmap of commit `id`, if one was stored.
    pub fn bitmap_for(&self, id: &ObjectId, index: &PackIndex) -> PackResult<Option<Arc<Bitmap>>> {
        let Some(position) = index.find_position(id) else {
            return Ok(None);
        };
        match self.by_position.get(&(position as u32)) {
            Some(&n) => self.resolve(n).map(Some),
            None => Ok(None),
        }
    }

    /// Flags stored with the entry for `id`.
    pub fn entry_flags(&self, id: &ObjectId, index: &PackIndex) -> Option<u8> {
        let position = index.find_position(id)? as u32;
        self.by_position
            .get(&position)
            .map(|&n| self.entries[n].flags)
    }

    /// Ids of the objects whose bits are set, in pack order.
    pub fn ids_in(&self, bitmap: &Bitmap, reverse: &ReverseIndex) -> PackResult<Vec<ObjectId>> {
        bitmap
            .iter_ones()
            .map(|n| {
                reverse.object_at(n).ok_or_else(|| {
                    PackError::Format(format!("bitmap bit {n} beyond pack object count"))
                })
            })
            .collect()
    }

    fn resolve(&self, n: usize) -> PackResult<Arc<Bitmap>> {
        let cached = self.resolved.lock().get(&n).cloned();
        if let Some(b) = cached {
            return Ok(b);
        }

        let mut chain = vec![n];
        let mut at = n;
        while self.entries[at].xor_offset != 0 {
            at -= usize::from(self.entries[at].xor_offset);
            let cached = self.resolved.lock().get(&at).cloned();
            if let Some(base) = cached {
                return self.fold(chain, base);
            }
            chain.push(at);
        }
        let base = Arc::new(Bitmap::new());
        self.fold(chain, base)
    }

    /// XOR the entries of `chain` (nearest first) onto `base`.
    fn fold(&self, chain: Vec<usize>, base: Arc<Bitmap>) -> PackResult<Arc<Bitmap>> {
        let mut acc = base;
        for &n in chain.iter().rev() {
            let own = self.entries[n].bitmap.decompress()?;
            let b = Arc::new(own.xor(&acc));
            self.resolved.lock().insert(n, Arc::clone(&b));
            acc = b;
        }
        Ok(acc)
    }

    /// idx positions of the commits that have bitmaps.
    pub fn commit_positions(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|e| e.index_position)
    }
}

fn be_u32(data: &[u8], pos: &mut usize) -> PackResult<u32> {
    let b = data
        .get(*pos..*pos + 4)
        .ok_or_else(|| PackError::Format("bitmap index truncated".into()))?;
    *pos += 4;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}
