use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A stored document could not be (de)serialized.
    #[error("Document error: {0}")]
    Document(#[from] serde_json::Error),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A lookup expected a document but found none.
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// The store did not answer within the configured bound.
    #[error("Store operation '{op}' timed out after {millis} ms")]
    Timeout { op: &'static str, millis: u128 },

    /// The blocking task running a store call panicked or was cancelled.
    #[error("Store task failed: {0}")]
    Task(String),

    /// The store lock was poisoned by a panicking writer.
    #[error("Store lock poisoned")]
    Poisoned,

    /// A multi-step write failed on every attempt.
    #[error("Cascade for user {user} failed after {attempts} attempts: {last}")]
    CascadeFailed {
        user: i64,
        attempts: u32,
        last: String,
    },
}

impl StoreError {
    /// Whether this error means the store itself is unavailable, as opposed
    /// to a missing document.
    pub fn is_unavailable(&self) -> bool {
        !matches!(self, StoreError::NotFound(_))
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
