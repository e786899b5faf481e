//! The [`DfsStorage`] trait: where pack files actually live.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use dfs_cache::FileOpener;
use dfs_types::{PackDescription, PackExt, PackSource, RepositoryDescription};

use crate::error::OdbResult;

/// A file being written to storage. Readers see it only after `close`.
pub trait DfsOutputStream: Write + Send {
    /// Preferred write size in bytes, 0 if the backend has none.
    fn block_size(&self) -> u32 {
        0
    }

    /// Finish the file and make it readable.
    fn close(self: Box<Self>) -> io::Result<()>;
}

/// Backing storage for one repository's packs and reftables.
///
/// Implementations must be thread-safe. Reads go through
/// [`FileOpener::open_file`]; a pack becomes visible to
/// [`list_packs`](Self::list_packs) only once committed.
pub trait DfsStorage: FileOpener {
    fn repository(&self) -> &RepositoryDescription;

    /// Descriptions of every committed pack and reftable.
    fn list_packs(&self) -> OdbResult<Vec<PackDescription>>;

    /// Allocate a description for a pack about to be written.
    fn new_pack(&self, source: PackSource) -> OdbResult<PackDescription>;

    /// Open one file of an uncommitted pack for writing.
    fn write_file(&self, desc: &PackDescription, ext: PackExt) -> OdbResult<Box<dyn DfsOutputStream>>;

    /// Publish `added` and retire `replaced` in one step.
    fn commit_pack(&self, added: &[PackDescription], replaced: &[PackDescription]) -> OdbResult<()>;

    /// Discard the files of packs that were never committed.
    fn rollback_pack(&self, descs: &[PackDescription]) -> OdbResult<()>;
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
