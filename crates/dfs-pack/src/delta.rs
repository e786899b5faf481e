//! Git binary delta: decoding and a simple encoder.
//!
//! A delta is `base size (varint) | result size (varint) | instructions`.
//! An instruction with the high bit set copies a range of the base; its low
//! seven bits select which little-endian offset (4) and size (3) bytes
//! follow, and a size of zero means 0x10000. Any other non-zero byte `n`
//! inserts the next `n` literal bytes.

use std::collections::HashMap;

use crate::error::{PackError, PackResult};

/// Largest single copy an instruction can express.
const MAX_COPY: usize = 0x10000;
/// Largest literal run an insert instruction can express.
const MAX_INSERT: usize = 0x7f;
/// Granularity of the encoder's base index.
const CHUNK: usize = 16;

fn read_varint(delta: &[u8], pos: &mut usize) -> PackResult<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let b = *delta
            .get(*pos)
            .ok_or_else(|| PackError::Delta("truncated size header".into()))?;
        *pos += 1;
        if shift > 63 {
            return Err(PackError::Delta("size header overflows 64 bits".into()));
        }
        value |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Base and result sizes declared by a delta header.
///
/// Only needs the first few bytes of the delta.
pub fn delta_sizes(delta: &[u8]) -> PackResult<(u64, u64)> {
    let mut pos = 0;
    let base = read_varint(delta, &mut pos)?;
    let result = read_varint(delta, &mut pos)?;
    Ok((base, result))
}

/// Apply `delta` to `base`, appending the result to `out` (cleared first).
///
/// The caller should reserve the result size in `out` beforehand.
pub fn apply_delta(base: &[u8], delta: &[u8], out: &mut Vec<u8>) -> PackResult<()> {
    out.clear();
    let mut pos = 0;
    let base_size = read_varint(delta, &mut pos)?;
    let result_size = read_varint(delta, &mut pos)?;
    if base_size != base.len() as u64 {
        return Err(PackError::Delta(format!(
            "base is {} bytes, delta expects {base_size}",
            base.len()
        )));
    }

    while pos < delta.len() {
        let cmd = delta[pos];
        pos += 1;
        if cmd & 0x80 != 0 {
            let mut offset = 0usize;
            let mut size = 0usize;
            for i in 0..4 {
                if cmd & (1 << i) != 0 {
                    offset |= usize::from(next_byte(delta, &mut pos)?) << (8 * i);
                }
            }
            for i in 0..3 {
                if cmd & (0x10 << i) != 0 {
                    size |= usize::from(next_byte(delta, &mut pos)?) << (8 * i);
                }
            }
            if size == 0 {
                size = MAX_COPY;
            }
            let end = offset
                .checked_add(size)
                .filter(|&end| end <= base.len())
                .ok_or_else(|| PackError::Delta("copy outside of base".into()))?;
            if (out.len() + size) as u64 > result_size {
                return Err(PackError::Delta("result overruns declared size".into()));
            }
            out.extend_from_slice(&base[offset..end]);
        } else if cmd != 0 {
            let size = usize::from(cmd);
            let end = pos + size;
            if end > delta.len() {
                return Err(PackError::Delta("truncated insert".into()));
            }
            if (out.len() + size) as u64 > result_size {
                return Err(PackError::Delta("result overruns declared size".into()));
            }
            out.extend_from_slice(&delta[pos..end]);
            pos = end;
        } else {
            return Err(PackError::Delta("reserved instruction 0".into()));
        }
    }

    if out.len() as u64 != result_size {
        return Err(PackError::Delta(format!(
            "result is {} bytes, delta declares {result_size}",
            out.len()
        )));
    }
    Ok(())
}

fn next_byte(delta: &[u8], pos: &mut usize) -> PackResult<u8> {
    let b = *delta
        .get(*pos)
        .ok_or_else(|| PackError::Delta("truncated copy instruction".into()))?;
    *pos += 1;
    Ok(b)
}

/// Builds deltas against one base.
///
/// The base is indexed in fixed-size chunks; targets are scanned for chunk
/// matches which are then extended greedily. Good enough for pack writing
/// in tests and tools, not a replacement for a real delta search.
pub struct DeltaEncoder<'a> {
    base: &'a [u8],
    index: HashMap<&'a [u8], usize>,
}

impl<'a> DeltaEncoder<'a> {
    pub fn new(base: &'a [u8]) -> Self {
        let mut index = HashMap::new();
        for (i, chunk) in base.chunks_exact(CHUNK).enumerate() {
            index.entry(chunk).or_insert(i * CHUNK);
        }
        Self { base, index }
    }

    /// Encode `target` as a delta against the base.
    pub fn encode(&self, target: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(target.len() / 4 + 16);
        write_varint(&mut out, self.base.len() as u64);
        write_varint(&mut out, target.len() as u64);

        let mut literal_start = 0;
        let mut i = 0;
        while i + CHUNK <= target.len() {
            let Some(&base_offset) = self.index.get(&target[i..i + CHUNK]) else {
                i += 1;
                continue;
            };
            let mut len = CHUNK;
            while base_offset + len < self.base.len()
                && i + len < target.len()
                && self.base[base_offset + len] == target[i + len]
            {
                len += 1;
            }
            emit_insert(&mut out, &target[literal_start..i]);
            emit_copy(&mut out, base_offset, len);
            i += len;
            literal_start = i;
        }
        emit_insert(&mut out, &target[literal_start..]);
        out
    }
}

fn emit_insert(out: &mut Vec<u8>, mut data: &[u8]) {
    while !data.is_empty() {
        let n = data.len().min(MAX_INSERT);
        out.push(n as u8);
        out.extend_from_slice(&data[..n]);
        data = &data[n..];
    }
}

fn emit_copy(out: &mut Vec<u8>, mut offset: usize, mut len: usize) {
    while len > 0 {
        let size = len.min(MAX_COPY);
        let cmd_at = out.len();
        let mut cmd = 0x80u8;
        out.push(0);
        for i in 0..4 {
            let b = (offset >> (8 * i)) as u8;
            if b != 0 {
                cmd |= 1 << i;
                out.push(b);
            }
        }
        if size != MAX_COPY {
            for i in 0..3 {
                let b = (size >> (8 * i)) as u8;
                if b != 0 {
                    cmd |= 0x10 << i;
                    out.push(b);
                }
            }
        }
        out[cmd_at] = cmd;
        offset += size;
        len -= size;
    }
}
