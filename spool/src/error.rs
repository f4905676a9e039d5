//! Error types for spool operations.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DuckDB error: {0}")]
    DuckDb(#[from] duckdb::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The collector was used outside a `configure`..`finalize` bracket.
    ///
    /// This almost always means the profiling middleware is missing or
    /// ordered after something that short-circuits the request.
    #[error("Collector not configured: {0} Is the middleware installed correctly?")]
    NotConfigured(String),

    /// Bookkeeping bug: buffered records reference each other inconsistently.
    #[error("Internal inconsistency: {0}. This should never happen, please file a bug report")]
    InternalInconsistency(String),

    #[error("A profile used as a block must have a name")]
    UnnamedSpan,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("spool not initialized at {0}")]
    NotInitialized(PathBuf),

    #[error("spool already initialized at {0}")]
    AlreadyInitialized(PathBuf),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// DuckDB message fragments of failures that go away on retry.
const TRANSIENT_MESSAGES: &[&str] = &[
    "conflict on update",
    "conflict on tuple deletion",
    "write-write conflict",
    "could not set lock on file",
    "duplicate key",
];

impl Error {
    /// Whether the error is a transient persistence failure worth retrying.
    ///
    /// Covers write-write conflicts between concurrent transactions, lock
    /// contention on the database file and duplicate-key races caused by a
    /// response being processed twice.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::DuckDb(e) => {
                let msg = e.to_string().to_lowercase();
                TRANSIENT_MESSAGES.iter().any(|needle| msg.contains(needle))
            }
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
