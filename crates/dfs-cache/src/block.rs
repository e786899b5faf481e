use std::io::{self, Write};

use bytes::Bytes;

use crate::stream_key::StreamKey;

/// A contiguous run of bytes read from a file, starting at a block-aligned
/// position. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct Block {
    key: StreamKey,
    start: u64,
    data: Bytes,
}

impl Block {
    pub fn new(key: StreamKey, start: u64, data: Bytes) -> Self {
        Self { key, start, data }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// File offset of the first byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// File offset one past the last byte.
    pub fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// True if this block holds byte `position` of the file named by `key`.
    pub fn contains(&self, key: &StreamKey, position: u64) -> bool {
        &self.key == key && self.start <= position && position < self.end()
    }

    /// Bytes from `position` to the end of the block; empty if `position`
    /// is outside the block.
    pub fn remaining(&self, position: u64) -> &[u8] {
        match self.offset_of(position) {
            Some(ptr) => &self.data[ptr..],
            None => &[],
        }
    }

    /// Zero-copy view of up to `len` bytes starting at `position`.
    pub fn slice(&self, position: u64, len: usize) -> Bytes {
        match self.offset_of(position) {
            Some(ptr) => {
                let end = ptr + len.min(self.data.len() - ptr);
                self.data.slice(ptr..end)
            }
            None => Bytes::new(),
        }
    }

    /// Copy bytes starting at `position` into `dst`; returns the count copied.
    pub fn copy(&self, position: u64, dst: &mut [u8]) -> usize {
        let src = self.remaining(position);
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        n
    }

    /// Feed up to `len` bytes starting at `position` into a CRC32 hasher;
    /// returns the count fed.
    pub fn crc32(&self, hasher: &mut crc32fast::Hasher, position: u64, len: usize) -> usize {
        let src = self.remaining(position);
        let n = src.len().min(len);
        hasher.update(&src[..n]);
        n
    }

    /// Write up to `len` bytes starting at `position`; returns the count written.
    pub fn write_to(&self, out: &mut dyn Write, position: u64, len: usize) -> io::Result<usize> {
        let src = self.remaining(position);
        let n = src.len().min(len);
        out.write_all(&src[..n])?;
        Ok(n)
    }

    fn offset_of(&self, position: u64) -> Option<usize> {
        (self.start <= position && position < self.end()).then(|| (position - self.start) as usize)
    }
}
