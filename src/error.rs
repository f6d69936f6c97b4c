//! Application error types.
//!
//! Defines `SpoolError` variants for the different failure modes of the
//! server: configuration problems, store and history I/O, upstream protocol
//! errors, and article validation. Protocol-level verdicts that are not
//! failures (duplicate, spam-rejected, unknown group) are carried by
//! `processor::IngestOutcome`, not by this enum.

use std::io;

pub type Result<T> = std::result::Result<T, SpoolError>;

#[derive(Debug, thiserror::Error)]
pub enum SpoolError {
    /// Configuration file missing, unreadable, or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Embedded store errors (main DB, per-group DBs, history shards).
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File system or socket I/O errors.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Upstream NNTP connection or protocol errors.
    #[error("nntp error: {0}")]
    Nntp(String),

    /// Article failed header validation.
    #[error("malformed article: {0}")]
    Malformed(String),

    /// History log record failed structural validation.
    #[error("corrupt history record at offset {offset}")]
    CorruptRecord { offset: u64 },

    /// The component is shutting down and no longer accepts work.
    #[error("shutting down")]
    ShuttingDown,
}

impl SpoolError {
    /// Whether retrying the operation on a fresh connection may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SpoolError::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::PermissionDenied | io::ErrorKind::StorageFull
            ),
            SpoolError::Nntp(_) => true,
            _ => false,
        }
    }
}
