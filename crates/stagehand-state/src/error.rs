//! Error types for the Stagehand state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors raised by the redb-backed store, named after the step that failed.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("failed to begin transaction: {0}")]
    Begin(String),

    #[error("failed to commit transaction: {0}")]
    Commit(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("failed to encode row: {0}")]
    Encode(String),

    /// A stored row no longer decodes into its domain type.
    #[error("corrupt row {key}: {reason}")]
    CorruptRow { key: String, reason: String },
}
