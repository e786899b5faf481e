use std::io::{self, Read};
use std::sync::Arc;

use bytes::{Buf, Bytes};
use dfs_cache::{Block, CacheError, FileOpener};
use dfs_types::{ObjectId, ObjectType};
use flate2::{Decompress, FlushDecompress, Status};
use tracing::debug;

use crate::context::ReadContext;
use crate::error::{PackError, PackResult};
use crate::pack_file::PackFile;

/// A loaded object: small ones are materialized, large whole objects are
/// streamed from the pack on demand.
#[derive(Debug)]
pub enum ObjectLoader {
    Small { object_type: ObjectType, data: Bytes },
    Large(LargeObject),
}

impl ObjectLoader {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::Small { object_type, .. } => *object_type,
            Self::Large(large) => large.object_type,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            Self::Small { data, .. } => data.len() as u64,
            Self::Large(large) => large.size,
        }
    }

    pub fn is_large(&self) -> bool {
        matches!(self, Self::Large(_))
    }

    /// The object's bytes, if they were materialized.
    pub fn cached_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Small { data, .. } => Some(data),
            Self::Large(_) => None,
        }
    }

    /// The object's bytes; large objects must be streamed instead.
    pub fn into_bytes(self) -> PackResult<Bytes> {
        match self {
            Self::Small { data, .. } => Ok(data),
            Self::Large(large) => Err(PackError::LargeObjectExceedsLimit {
                offset: large.offset,
                size: large.size,
                limit: large.threshold,
            }),
        }
    }

    /// Read the object's content.
    pub fn open_stream(&self, ctx: &mut ReadContext) -> PackResult<Box<dyn Read + Send>> {
        match self {
            Self::Small { data, .. } => Ok(Box::new(data.clone().reader())),
            Self::Large(large) => large.open_stream(ctx),
        }
    }
}

/// A whole object too large to inflate into memory at once.
pub struct LargeObject {
    pack: Arc<PackFile>,
    offset: u64,
    data_offset: u64,
    object_type: ObjectType,
    size: u64,
    threshold: u64,
    id: Option<ObjectId>,
}

impl LargeObject {
    pub(crate) fn new(
        pack: Arc<PackFile>,
        offset: u64,
        data_offset: u64,
        object_type: ObjectType,
        size: u64,
        threshold: u64,
    ) -> Self {
        Self {
            pack,
            offset,
            data_offset,
            object_type,
            size,
            threshold,
            id: None,
        }
    }

    /// Remember the id, so a reopen need not consult the reverse index.
    pub fn with_id(mut self, id: ObjectId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn object_type(&self) -> ObjectType {
        self.object_type
    }

    pub fn pack(&self) -> &Arc<PackFile> {
        &self.pack
    }

    /// Open a reader over the inflated content.
    ///
    /// If the pack can no longer be read, the object's id is recovered from
    /// the reverse index and the context's reopen hook is asked for a copy
    /// from another pack.
    pub fn open_stream(&self, ctx: &mut ReadContext) -> PackResult<Box<dyn Read + Send>> {
        let first = if self.pack.is_invalid() {
            Err(PackError::Cache(self.pack.file().invalid_error()))
        } else {
            self.pack
                .file()
                .get_or_load_block(self.data_offset, ctx.opener().as_ref())
                .map_err(PackError::from)
        };
        match first {
            Ok(block) => Ok(Box::new(LargeObjectStream {
                pack: Arc::clone(&self.pack),
                opener: Arc::clone(ctx.opener()),
                block: Some(block),
                position: self.data_offset,
                inflater: Decompress::new(true),
                expected: self.size,
                produced: 0,
                done: false,
            })),
            Err(err) => self.reopen(ctx, err),
        }
    }

    fn reopen(&self, ctx: &mut ReadContext, err: PackError) -> PackResult<Box<dyn Read + Send>> {
        let Some(reopen) = ctx.reopen().cloned() else {
            return Err(err);
        };
        let id = match self.id {
            Some(id) => id,
            None => match self.pack.reverse_index(ctx)?.find_object(self.offset) {
                Some(id) => id,
                None => return Err(err),
            },
        };
        debug!(
            pack = %self.pack.desc().pack_name,
            object = %id.short_hex(),
            error = %err,
            "reopening large object from another pack"
        );
        let loader = reopen(&id, self.object_type)?;
        if let ObjectLoader::Large(other) = &loader {
            if Arc::ptr_eq(&other.pack, &self.pack) {
                return Err(err);
            }
        }
        loader.open_stream(ctx)
    }
}

impl std::fmt::Debug for LargeObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LargeObject")
            .field("pack", &self.pack.desc().pack_name)
            .field("offset", &self.offset)
            .field("type", &self.object_type)
            .field("size", &self.size)
            .finish()
    }
}

/// Pull-based inflater over pack blocks. Holds the block it is reading so
/// cache eviction cannot pull it away mid-read.
struct LargeObjectStream {
    pack: Arc<PackFile>,
    opener: Arc<dyn FileOpener>,
    block: Option<Arc<Block>>,
    position: u64,
    inflater: Decompress,
    expected: u64,
    produced: u64,
    done: bool,
}

impl LargeObjectStream {
    fn block(&mut self) -> io::Result<Arc<Block>> {
        if let Some(b) = &self.block {
            if b.contains(b.key(), self.position) {
                return Ok(Arc::clone(b));
            }
        }
        let b = self
            .pack
            .file()
            .get_or_load_block(self.position, self.opener.as_ref())
            .map_err(cache_io_error)?;
        self.block = Some(Arc::clone(&b));
        Ok(b)
    }

    /// A stream that does not inflate to the declared object means the
    /// pack is damaged; invalidate it before reporting.
    fn corrupt(&mut self, kind: io::ErrorKind, reason: String) -> io::Error {
        self.done = true;
        self.pack
            .file()
            .mark_invalid(Arc::new(io::Error::new(kind, reason.clone())));
        io::Error::new(kind, reason)
    }
}

impl Read for LargeObjectStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() || self.done {
            return Ok(0);
        }
        loop {
            let block = self.block()?;
            let input = block.remaining(self.position);
            let (in_before, out_before) = (self.inflater.total_in(), self.inflater.total_out());
            let status = self
                .inflater
                .decompress(input, out, FlushDecompress::None)
                .map_err(|e| self.corrupt(io::ErrorKind::InvalidData, e.to_string()))?;
            let used = self.inflater.total_in() - in_before;
            let n = (self.inflater.total_out() - out_before) as usize;
            self.position += used;
            self.produced += n as u64;

            if self.produced > self.expected {
                let reason = format!("object inflates past its declared {} bytes", self.expected);
                return Err(self.corrupt(io::ErrorKind::InvalidData, reason));
            }
            if status == Status::StreamEnd {
                self.done = true;
                if self.produced != self.expected {
                    let reason = format!("object inflated to {} of {} bytes", self.produced, self.expected);
                    return Err(self.corrupt(io::ErrorKind::UnexpectedEof, reason));
                }
                return Ok(n);
            }
            if n > 0 {
                return Ok(n);
            }
            if used == 0 {
                return Err(self.corrupt(io::ErrorKind::InvalidData, "inflater made no progress".into()));
            }
        }
    }
}

fn cache_io_error(err: CacheError) -> io::Error {
    match err {
        CacheError::Io(e) => e,
        other => io::Error::other(other),
    }
}
