use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dfs_types::{PackDescription, PackExt};
use parking_lot::Mutex;
use tracing::warn;

use crate::block::Block;
use crate::cache::BlockCache;
use crate::channel::{read_fully, ChannelSupplier, FileOpener, LazyChannel, ReadableChannel};
use crate::error::{CacheError, CacheResult, InvalidCause};
use crate::stream_key::StreamKey;

const UNKNOWN_LENGTH: u64 = u64::MAX;

/// One file of a pack, read in cache-sized blocks.
///
/// Block size and length are discovered lazily from the first channel
/// opened and then fixed. Once marked invalid, every further read fails.
pub struct BlockBasedFile {
    cache: Arc<BlockCache>,
    desc: Arc<PackDescription>,
    ext: PackExt,
    key: StreamKey,
    file_name: String,
    /// 0 until known.
    block_size: AtomicU32,
    length: AtomicU64,
    invalid: AtomicBool,
    invalid_cause: Mutex<Option<InvalidCause>>,
}

impl BlockBasedFile {
    /// Wrap the `ext` file of `desc`, taking its size and block size from
    /// the description when known.
    pub fn new(cache: Arc<BlockCache>, desc: Arc<PackDescription>, ext: PackExt) -> Self {
        let file_name = desc.file_name(ext);
        let key = StreamKey::of(&desc.repository, file_name.clone(), ext);
        let length = match desc.file_size(ext) {
            0 => UNKNOWN_LENGTH,
            n => n,
        };
        Self {
            block_size: AtomicU32::new(desc.block_size(ext)),
            length: AtomicU64::new(length),
            cache,
            desc,
            ext,
            key,
            file_name,
            invalid: AtomicBool::new(false),
            invalid_cause: Mutex::new(None),
        }
    }

    /// Cache the file's blocks are read through.
    pub fn cache(&self) -> &Arc<BlockCache> {
        &self.cache
    }

    /// Description of the pack this file belongs to.
    pub fn desc(&self) -> &Arc<PackDescription> {
        &self.desc
    }

    /// Which of the pack's files this is.
    pub fn ext(&self) -> PackExt {
        self.ext
    }

    /// Cache key of the file's blocks.
    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Name used in errors and logs, e.g. `pack-1.pack`.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// File length, once known.
    pub fn length(&self) -> Option<u64> {
        match self.length.load(Ordering::Acquire) {
            UNKNOWN_LENGTH => None,
            n => Some(n),
        }
    }

    /// Record the length once a channel has reported it.
    pub fn set_length(&self, length: u64) {
        self.length.store(length, Ordering::Release);
    }

    /// Block size, or 0 before the first block is read.
    pub fn block_size(&self) -> u32 {
        self.block_size.load(Ordering::Acquire)
    }

    /// Fix the block size used to align reads of this file.
    pub fn set_block_size(&self, size: u32) {
        self.block_size.store(size, Ordering::Release);
    }

    /// True once a read or parse of the file has failed for good.
    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Mark the file unusable. The first cause recorded wins.
    pub fn mark_invalid(&self, cause: InvalidCause) {
        let mut slot = self.invalid_cause.lock();
        if slot.is_none() {
            warn!(file = %self.file_name, error = %cause, "marking pack file invalid");
            *slot = Some(cause);
        }
        self.invalid.store(true, Ordering::Release);
    }

    /// The error reported for reads of an invalid file.
    pub fn invalid_error(&self) -> CacheError {
        let cause = self
            .invalid_cause
            .lock()
            .clone()
            .unwrap_or_else(|| Arc::new(io::Error::other("file was invalidated")));
        CacheError::PackInvalid {
            file: self.file_name.clone(),
            cause,
        }
    }

    /// Round `position` down to its block start.
    pub fn align_to_block(&self, position: u64) -> u64 {
        let size = match self.block_size() {
            0 => self.cache.block_size(),
            n => n,
        };
        position - position % u64::from(size)
    }

    /// Block holding `position`, opening the file through `opener` only
    /// on a cache miss.
    pub fn get_or_load_block(&self, position: u64, opener: &dyn FileOpener) -> CacheResult<Arc<Block>> {
        let mut channel = LazyChannel::new(opener, &self.desc, self.ext);
        self.get_or_load_block_with(position, &mut channel)
    }

    /// Block holding `position`, reading through an already-chosen channel.
    pub fn get_or_load_block_with(
        &self,
        position: u64,
        channels: &mut dyn ChannelSupplier,
    ) -> CacheResult<Arc<Block>> {
        if self.is_invalid() {
            return Err(self.invalid_error());
        }
        self.cache.get_or_load(self, position, channels)
    }

    /// Read the block containing `position` straight from `rc`.
    pub fn read_one_block(&self, position: u64, rc: &mut dyn ReadableChannel) -> CacheResult<Block> {
        if self.is_invalid() {
            return Err(self.invalid_error());
        }

        let block_size = u64::from(self.negotiate_block_size(rc));
        let start = position - position % block_size;

        let mut length = self.length();
        if length.is_none() {
            length = rc.size()?;
            if let Some(len) = length {
                self.set_length(len);
            }
        }

        let size = match length {
            Some(len) if len < start + block_size => len.saturating_sub(start),
            _ => block_size,
        } as usize;
        if size == 0 {
            return Err(self.short_read(start, block_size as usize, 0));
        }

        let mut buf = vec![0u8; size];
        rc.set_position(start)?;
        let count = read_fully(rc, &mut buf)?;
        if count != size {
            if length.is_some() || count == 0 {
                return Err(self.short_read(start, size, count));
            }
            buf.truncate(count);
        } else if length.is_none() {
            if let Some(len) = rc.size()? {
                self.set_length(len);
            }
        }

        Ok(Block::new(self.key.clone(), start, Bytes::from(buf)))
    }

    /// Settle the block size on first use. A channel preferring a smaller
    /// size than the cache gets the largest multiple of it that fits.
    fn negotiate_block_size(&self, rc: &dyn ReadableChannel) -> u32 {
        let known = self.block_size();
        if known != 0 {
            return known;
        }
        let cache_size = self.cache.block_size();
        let size = match rc.block_size() {
            0 => cache_size,
            ch if ch < cache_size => (cache_size / ch) * ch,
            ch => ch,
        };
        self.set_block_size(size);
        size
    }

    /// A file shorter than described cannot be trusted; invalidate it so
    /// later reads fail without reopening it.
    pub(crate) fn short_read(&self, position: u64, expected: usize, actual: usize) -> CacheError {
        let err = || CacheError::ShortRead {
            file: self.file_name.clone(),
            position,
            expected,
            actual,
        };
        self.mark_invalid(Arc::new(err()));
        err()
    }
}

impl std::fmt::Debug for BlockBasedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBasedFile")
            .field("file", &self.file_name)
            .field("block_size", &self.block_size())
            .field("length", &self.length())
            .field("invalid", &self.is_invalid())
            .finish()
    }
}
