use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Shared, cloneable cause attached to an invalidated file.
pub type InvalidCause = Arc<dyn StdError + Send + Sync>;

/// Errors from block cache and block-based file operations.
///
/// The cache itself never fails; every variant here originates from reading
/// a file through it or from building it with a bad configuration.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The file was marked invalid by an earlier failure.
    #[error("pack file {file} is invalid: {cause}")]
    PackInvalid {
        file: String,
        #[source]
        cause: InvalidCause,
    },

    /// A block read returned fewer bytes than the block must hold.
    #[error("short read of block at {position} in {file}: expected {expected} bytes, got {actual}")]
    ShortRead {
        file: String,
        position: u64,
        expected: usize,
        actual: usize,
    },

    /// The cache configuration was rejected.
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    /// I/O error from the underlying channel.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;
