use std::sync::Arc;

use dfs_cache::{Block, BlockBasedFile, BlockCache, CacheResult, FileOpener};
use dfs_types::{PackDescription, PackExt};

/// A reftable file read through the block cache.
///
/// Parsing the table is left to the reference database; this wrapper only
/// hands out cached blocks and tracks whether the file went bad.
#[derive(Debug)]
pub struct ReftableFile {
    file: BlockBasedFile,
}

impl ReftableFile {
    pub fn new(cache: Arc<BlockCache>, desc: Arc<PackDescription>) -> Self {
        Self {
            file: BlockBasedFile::new(cache, desc, PackExt::Reftable),
        }
    }

    pub fn desc(&self) -> &Arc<PackDescription> {
        self.file.desc()
    }

    pub fn file(&self) -> &BlockBasedFile {
        &self.file
    }

    pub fn is_invalid(&self) -> bool {
        self.file.is_invalid()
    }

    /// The cached block holding `position`.
    pub fn block(&self, position: u64, opener: &dyn FileOpener) -> CacheResult<Arc<Block>> {
        self.file.get_or_load_block(position, opener)
    }

    /// Copy bytes starting at `position` into `buf`; returns the count,
    /// short only at end of file.
    pub fn read(&self, position: u64, buf: &mut [u8], opener: &dyn FileOpener) -> CacheResult<usize> {
        let mut n = 0;
        while n < buf.len() {
            let at = position + n as u64;
            if self.file.length().is_some_and(|len| at >= len) {
                break;
            }
            let copied = self.block(at, opener)?.copy(at, &mut buf[n..]);
            if copied == 0 {
                break;
            }
            n += copied;
        }
        Ok(n)
    }
}
