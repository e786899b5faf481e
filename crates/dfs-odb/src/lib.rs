//! The DFS object database.
//!
//! [`ObjectDatabase`] tracks which packs and reftables a repository has,
//! publishing each change as a new immutable [`PackList`] that readers load
//! without locking. [`Reader`] looks objects up across that list. Files
//! live behind the [`DfsStorage`] trait; [`InMemoryStorage`] and
//! [`LocalDirStorage`] are the bundled backends.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use dfs_cache::{BlockCache, BlockCacheConfig};
//! use dfs_odb::{InMemoryStorage, ObjectDatabase};
//! use dfs_pack::PackWriter;
//! use dfs_types::{ObjectType, PackSource, RepositoryDescription};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(InMemoryStorage::new(RepositoryDescription::new("demo")));
//! let cache = Arc::new(BlockCache::new(BlockCacheConfig::default())?);
//! let db = Arc::new(ObjectDatabase::new(storage, cache));
//!
//! let mut writer = PackWriter::new();
//! let id = writer.add_object(ObjectType::Blob, b"hello");
//! db.write_pack(PackSource::Insert, writer)?;
//!
//! let mut reader = db.new_reader();
//! let data = reader.open(&id, Some(ObjectType::Blob))?.into_bytes()?;
//! assert_eq!(&data[..], b"hello");
//! # Ok(())
//! # }
//! ```

pub mod database;
pub mod error;
pub mod local;
pub mod memory;
pub mod pack_list;
pub mod reader;
pub mod reftable;
pub mod storage;

pub use database::{ObjectDatabase, PackOrder, PacksChangedListener};
pub use error::{OdbError, OdbResult};
pub use local::LocalDirStorage;
pub use memory::InMemoryStorage;
pub use pack_list::PackList;
pub use reader::{ObjectQueue, ObjectRepresentation, Reader, MAX_RESOLVE_MATCHES};
pub use reftable::ReftableFile;
pub use storage::{DfsOutputStream, DfsStorage};
