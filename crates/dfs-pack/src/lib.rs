//! Git pack reading over the DFS block cache.
//!
//! [`PackFile`] reads objects from one pack: it parses the `.idx` (and
//! optionally the `.bitmap`) on first use, walks delta chains through
//! cached blocks, streams large whole objects, and copies stored entries
//! as-is into new packs. Per-reader state lives in a [`ReadContext`].
//!
//! # Key Types
//!
//! - [`PackFile`] -- one pack and its lazily loaded indexes
//! - [`PackIndex`] -- object id to offset lookup (idx v1 and v2)
//! - [`ReverseIndex`] -- offset to object id, in pack order
//! - [`BitmapIndex`] -- EWAH reachability bitmaps
//! - [`ObjectLoader`] -- a loaded object, small or streamed
//! - [`PackWriter`] / [`PackOutputStream`] -- building new packs

pub mod bitmap;
pub mod context;
pub mod delta;
pub mod delta_base_cache;
pub mod error;
pub mod format;
pub mod index;
pub mod large_object;
pub mod output;
pub mod pack_file;
pub mod reverse_index;
pub mod writer;

pub use bitmap::{Bitmap, BitmapIndex, EwahBitmap};
pub use context::{ReadContext, ReaderOptions, ReaderStats, ReopenFn};
pub use delta_base_cache::DeltaBaseCache;
pub use error::{PackError, PackResult};
pub use format::{EntryHeader, EntryKind};
pub use index::{IndexEntry, PackIndex};
pub use large_object::{LargeObject, ObjectLoader};
pub use output::{ObjectToPack, PackOutputStream};
pub use pack_file::{PackFile, StoredRepresentation};
pub use reverse_index::ReverseIndex;
pub use writer::{deflate, object_id, PackWriter, WrittenPack};
