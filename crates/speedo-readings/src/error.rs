//! Error types for the reading store.

/// Errors that can occur during reading store operations.
#[derive(Debug, thiserror::Error)]
pub enum ReadingError {
    /// A database operation failed.
    #[error("reading store database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored timestamp could not be parsed back into a UTC instant.
    #[error("reading store holds an invalid timestamp: {0}")]
    InvalidTimestamp(String),
}
