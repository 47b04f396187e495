use std::path::PathBuf;

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage layer errors.
///
/// `SegmentFull` and `Sealed` are internal signals: the log absorbs them by
/// rolling the tail segment. Everything else surfaces to the consensus layer,
/// which decides whether to halt the replica.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt segment {path:?}: {reason}")]
    CorruptSegment { path: PathBuf, reason: String },

    #[error("torn record at offset {offset} in {path:?}")]
    TornTail { path: PathBuf, offset: u64 },

    #[error("segment is full")]
    SegmentFull,

    #[error("segment is sealed")]
    Sealed,

    #[error("segment is read-only")]
    ReadOnly,

    #[error("non-monotonic index {index}, expected {expected}")]
    NonMonotonicIndex { index: u64, expected: u64 },

    #[error("index {index} outside the window [{first}, {last}]")]
    OutOfRange { index: u64, first: u64, last: u64 },

    #[error("commit handle already terminated")]
    InvalidState,

    #[error("query entries are not persisted")]
    QueryRefused,

    #[error("codec error: {0}")]
    Codec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("log is closed")]
    Closed,
}

impl StorageError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StorageError::CorruptSegment {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for conditions the log resolves internally by rolling the tail.
    pub fn is_roll_signal(&self) -> bool {
        matches!(self, StorageError::SegmentFull | StorageError::Sealed)
    }
}

impl From<bincode::error::EncodeError> for StorageError {
    fn from(e: bincode::error::EncodeError) -> Self {
        StorageError::Codec(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for StorageError {
    fn from(e: bincode::error::DecodeError) -> Self {
        StorageError::Codec(e.to_string())
    }
}
