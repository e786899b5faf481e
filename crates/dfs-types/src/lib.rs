//! Foundation types for the DFS object store.
//!
//! Every other DFS crate depends on `dfs-types`.
//!
//! # Key Types
//!
//! - [`ObjectId`] -- 20-byte object identifier, sorted by raw byte order
//! - [`AbbreviatedObjectId`] -- a hex prefix used for short-id resolution
//! - [`ObjectType`] -- commit, tree, blob, tag
//! - [`PackExt`] -- the files that make up a pack (pack, idx, bitmap, ...)
//! - [`PackSource`] -- why a pack exists; drives lookup priority
//! - [`PackDescription`] -- per-pack metadata, identity `(repository, name)`

pub mod error;
pub mod object;
pub mod pack;

pub use error::TypeError;
pub use object::{AbbreviatedObjectId, ObjectId, ObjectType, OBJECT_ID_LENGTH};
pub use pack::{PackDescription, PackExt, PackSource, RepositoryDescription};
