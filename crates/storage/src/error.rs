//! Failure taxonomy shared by every storage layer.

use std::io;

use thiserror::Error;

/// Coarse classification of a [`StorageError`], stable across layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// File or log I/O failed. The store is usable again after reopening.
    Io,
    /// On-disk data is corrupt or was written by something else.
    Format,
    /// A key, value or object exceeds a fixed limit, or a node cannot split.
    Capacity,
    /// An object is still held elsewhere, or a cursor's entry was removed.
    Concurrency,
    /// The requested key, object or name does not exist.
    NotFound,
    /// A name that must be unique is already taken.
    Exists,
    /// The file format version is not the one this build understands.
    Version,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("concurrent use: {0}")]
    Concurrency(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("metadata area {area} holds format version {found}, expected {expected}")]
    Version { area: usize, found: u32, expected: u32 },
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Io(_) => ErrorKind::Io,
            StorageError::Format(_) => ErrorKind::Format,
            StorageError::Capacity(_) => ErrorKind::Capacity,
            StorageError::Concurrency(_) => ErrorKind::Concurrency,
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::Version { .. } => ErrorKind::Version,
        }
    }

    /// Format and version failures leave the file unusable; everything else
    /// can be retried on the same store.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Format | ErrorKind::Version)
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_convert_and_classify() {
        let err: StorageError = io::Error::new(io::ErrorKind::Other, "disk gone").into();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn version_errors_are_fatal() {
        let err = StorageError::Version {
            area: 1,
            found: 9,
            expected: 1,
        };
        assert_eq!(err.kind(), ErrorKind::Version);
        assert!(!err.is_recoverable());
        assert!(!StorageError::Format("bad tag".into()).is_recoverable());
    }
}
