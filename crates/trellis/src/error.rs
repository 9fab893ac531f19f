use thiserror::Error;
use trellis_storage::{ErrorKind, StorageError};

use crate::object_id::ObjectId;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("index already exists: {0}")]
    IndexExists(String),

    #[error("object not found: {0}")]
    ObjectNotFound(ObjectId),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Storage(e) => e.kind(),
            Error::IndexNotFound(_) | Error::ObjectNotFound(_) => ErrorKind::NotFound,
            Error::IndexExists(_) => ErrorKind::Exists,
        }
    }

    /// Whether the store can keep being used after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Storage(e) => e.is_recoverable(),
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
