use dfs_cache::CacheError;
use dfs_types::ObjectId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PackError {
    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("corrupt object at offset {offset} in {file}: {reason}")]
    CorruptObject {
        offset: u64,
        file: String,
        reason: String,
    },

    #[error("object not found: {0}")]
    MissingObject(ObjectId),

    #[error("delta base {base} not found for object at offset {offset}")]
    MissingDeltaBase { base: ObjectId, offset: u64 },

    #[error("object at offset {offset} is {size} bytes, over the limit of {limit}")]
    LargeObjectExceedsLimit { offset: u64, size: u64, limit: u64 },

    #[error("out of memory allocating {size} bytes for object at offset {offset}")]
    LargeObjectOutOfMemory { offset: u64, size: u64 },

    #[error("unknown object type {type_code} at offset {offset}")]
    UnknownObjectType { type_code: u8, offset: u64 },

    #[error("invalid pack format: {0}")]
    Format(String),

    #[error("invalid delta: {0}")]
    Delta(String),

    #[error("pack index corrupted: {0}")]
    Index(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An as-is copy failed; the caller may fall back to another
    /// representation of the same object.
    #[error("stored representation unavailable: {0}")]
    RepresentationUnavailable(#[source] Box<PackError>),
}

impl PackError {
    /// True for errors that mean the requested object is simply absent.
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::MissingObject(_))
    }
}

pub type PackResult<T> = Result<T, PackError>;
