use std::collections::TryReserveError;
use std::io::{Error as IoError, ErrorKind};

use thiserror::Error;

use crate::content_id::ContentId;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    /// The shared index can't be trusted anymore; the whole cache must be rebuilt.
    #[error("Cache index is corrupted: {description}")]
    IndexCorrupted { description: String },
    /// A single entry is inconsistent with its files; only that entry is affected.
    #[error("Cache entry {id} is corrupted: {description}")]
    EntryCorrupted { id: ContentId, description: String },
    #[error("Refusing to cache {data_size} bytes of {id} with image size {image_size}")]
    InvalidWrite {
        id: ContentId,
        data_size: usize,
        image_size: i32,
    },
    #[error("Cache is read-only")]
    ReadOnly,
    #[error("Out of memory: {description}")]
    OutOfMemory { description: String },
    #[error("Cache operation cancelled: {description}")]
    Cancelled { description: String },
    #[error("IO Error: {0}")]
    Io(IoError),
}

impl CacheError {
    pub fn index_corrupted(description: impl Into<String>) -> Self {
        CacheError::IndexCorrupted {
            description: description.into(),
        }
    }

    pub fn entry_corrupted(id: ContentId, description: impl Into<String>) -> Self {
        CacheError::EntryCorrupted {
            id,
            description: description.into(),
        }
    }

    pub fn cancelled(description: impl Into<String>) -> Self {
        CacheError::Cancelled {
            description: description.into(),
        }
    }

    pub fn is_index_corruption(&self) -> bool {
        matches!(self, CacheError::IndexCorrupted { .. })
    }
}

impl From<IoError> for CacheError {
    fn from(err: IoError) -> Self {
        match err.kind() {
            ErrorKind::OutOfMemory => CacheError::OutOfMemory {
                description: format!("IO Error: {err}"),
            },
            _ => CacheError::Io(err),
        }
    }
}

impl From<TryReserveError> for CacheError {
    fn from(err: TryReserveError) -> Self {
        CacheError::OutOfMemory {
            description: err.to_string(),
        }
    }
}
