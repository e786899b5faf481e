//! Block cache for DFS pack files.
//!
//! Packs and their indexes are read in fixed-size blocks through one
//! process-wide [`BlockCache`], bounded by a byte budget and evicted with a
//! clock policy. Parsed index structures share the same budget as typed
//! references ([`CacheRef`]).
//!
//! [`BlockBasedFile`] is the per-file handle that aligns reads, discovers
//! block size and length, and remembers when a file turned out to be bad.

pub mod block;
pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod file;
pub mod stream_key;

pub use block::Block;
pub use cache::{BlockCache, CacheRef, CacheStats, REF_POSITION};
pub use channel::{read_fully, ByteChannel, ChannelSupplier, FileOpener, LazyChannel, ReadableChannel};
pub use config::BlockCacheConfig;
pub use error::{CacheError, CacheResult, InvalidCause};
pub use events::{IndexEventListener, IndexEvicted, IndexRequested};
pub use file::BlockBasedFile;
pub use stream_key::StreamKey;
