use std::io;

use bytes::Bytes;
use dfs_types::{PackDescription, PackExt};

/// A seekable, readable handle on one stored file.
///
/// Implementations come from the storage backend. They need not be
/// thread-safe; each reader opens its own.
pub trait ReadableChannel: Send {
    /// Current read position.
    fn position(&self) -> u64;

    /// Move the read position.
    fn set_position(&mut self, position: u64) -> io::Result<()>;

    /// Total file length, if the backend knows it yet.
    ///
    /// A backend that cannot report the length up front must report it
    /// once any read has reached the end of the file.
    fn size(&mut self) -> io::Result<Option<u64>>;

    /// Preferred read size, or 0 for no preference.
    fn block_size(&self) -> u32;

    /// Hint that the caller will read `bytes` sequentially.
    fn set_read_ahead_bytes(&mut self, _bytes: usize) -> io::Result<()> {
        Ok(())
    }

    /// Read into `buf`, returning the number of bytes read; 0 at end of file.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Opens channels onto the files of a pack.
pub trait FileOpener: Send + Sync {
    fn open_file(
        &self,
        desc: &PackDescription,
        ext: PackExt,
    ) -> io::Result<Box<dyn ReadableChannel>>;
}

/// Something that can hand out an open channel on demand.
pub trait ChannelSupplier {
    fn channel(&mut self) -> io::Result<&mut dyn ReadableChannel>;
}

impl ChannelSupplier for Box<dyn ReadableChannel> {
    fn channel(&mut self) -> io::Result<&mut dyn ReadableChannel> {
        Ok(self.as_mut())
    }
}

/// Opens a pack file only when a block actually has to be read.
pub struct LazyChannel<'a> {
    opener: &'a dyn FileOpener,
    desc: &'a PackDescription,
    ext: PackExt,
    channel: Option<Box<dyn ReadableChannel>>,
}

impl<'a> LazyChannel<'a> {
    pub fn new(opener: &'a dyn FileOpener, desc: &'a PackDescription, ext: PackExt) -> Self {
        Self {
            opener,
            desc,
            ext,
            channel: None,
        }
    }

    /// True once the underlying file has been opened.
    pub fn is_open(&self) -> bool {
        self.channel.is_some()
    }
}

impl ChannelSupplier for LazyChannel<'_> {
    fn channel(&mut self) -> io::Result<&mut dyn ReadableChannel> {
        if self.channel.is_none() {
            self.channel = Some(self.opener.open_file(self.desc, self.ext)?);
        }
        match self.channel.as_mut() {
            Some(ch) => Ok(ch.as_mut()),
            None => Err(io::Error::other("channel not open")),
        }
    }
}

/// Read until `buf` is full or the channel reaches end of file.
pub fn read_fully(rc: &mut dyn ReadableChannel, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = rc.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// A channel over an in-memory buffer.
///
/// Used by the in-memory storage backend. It can hide its length until the
/// first read to model backends that discover size lazily.
#[derive(Clone, Debug)]
pub struct ByteChannel {
    data: Bytes,
    position: u64,
    block_size: u32,
    size_known: bool,
}

impl ByteChannel {
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            position: 0,
            block_size: 0,
            size_known: true,
        }
    }

    /// Report `block_size` as the preferred read size.
    pub fn with_block_size(mut self, block_size: u32) -> Self {
        self.block_size = block_size;
        self
    }

    /// Withhold the length until a read has been issued.
    pub fn with_lazy_size(mut self) -> Self {
        self.size_known = false;
        self
    }
}

impl ReadableChannel for ByteChannel {
    fn position(&self) -> u64 {
        self.position
    }

    fn set_position(&mut self, position: u64) -> io::Result<()> {
        self.position = position;
        Ok(())
    }

    fn size(&mut self) -> io::Result<Option<u64>> {
        Ok(self.size_known.then_some(self.data.len() as u64))
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.size_known = true;
        let len = self.data.len() as u64;
        if self.position >= len {
            return Ok(0);
        }
        let start = self.position as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}
