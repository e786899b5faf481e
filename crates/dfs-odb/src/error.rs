use dfs_cache::CacheError;
use dfs_pack::PackError;
use dfs_types::{ObjectId, ObjectType};
use thiserror::Error;

/// Errors from the object database and its readers.
#[derive(Debug, Error)]
pub enum OdbError {
    #[error(transparent)]
    Pack(#[from] PackError),

    /// No current pack holds the object.
    #[error("missing object {id}")]
    MissingObject {
        id: ObjectId,
        object_type: Option<ObjectType>,
    },

    /// The object exists with a different type than requested.
    #[error("object {id} is a {actual}, not a {expected}")]
    IncorrectObjectType {
        id: ObjectId,
        expected: ObjectType,
        actual: ObjectType,
    },

    /// The backing storage rejected an operation.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A pack description could not be read or written.
    #[error("pack metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl OdbError {
    pub fn is_missing(&self) -> bool {
        match self {
            Self::MissingObject { .. } => true,
            Self::Pack(e) => e.is_missing(),
            _ => false,
        }
    }
}

impl From<CacheError> for OdbError {
    fn from(e: CacheError) -> Self {
        Self::Pack(PackError::Cache(e))
    }
}

/// Result alias for object database operations.
pub type OdbResult<T> = Result<T, OdbError>;
