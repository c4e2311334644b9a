//! Error types for the failure store.

use std::io;

use thiserror::Error;

use crate::RecordId;

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Record not found: {0}")]
    NotFound(RecordId),

    #[error("Record already exists: {0}")]
    AlreadyExists(RecordId),

    #[error("Spool path error: {0}")]
    Path(#[from] PathError),

    #[error("Spool capacity exceeded: {len}/{capacity} records")]
    CapacityExceeded { len: usize, capacity: usize },

    /// Injected or unexpected failures (lock poisoning, test doubles)
    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("Record {0} has trailing data")]
    Trailing(RecordId),
}

/// Rejected spool locations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("Spool path cannot contain '..' components: {0}")]
    Traversal(String),

    #[error("Spool path must be absolute: {0}")]
    Relative(String),

    #[error("Spool path cannot be in system directory {prefix}: {path}")]
    SystemDirectory { prefix: &'static str, path: String },

    #[error("Spool path is not a directory: {0}")]
    NotDirectory(String),
}

pub type Result<T> = std::result::Result<T, SpoolError>;

impl<T> From<std::sync::PoisonError<T>> for SpoolError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Internal(format!("Lock poisoned: {e}"))
    }
}

impl From<bincode::error::EncodeError> for SpoolError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(e.into())
    }
}

impl From<bincode::error::DecodeError> for SpoolError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(e.into())
    }
}
