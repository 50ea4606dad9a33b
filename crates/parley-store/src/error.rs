use parley_shared::CommunicationError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The addressed record does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// A JSON column could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Codec, blob storage or validation failure.
    #[error(transparent)]
    Communication(#[from] CommunicationError),

    /// The store was already closed.
    #[error("Store is closed")]
    Closed,
}

impl StoreError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }
}

impl From<StoreError> for CommunicationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => CommunicationError::NotFound(what),
            StoreError::Communication(inner) => inner,
            StoreError::Json(e) => CommunicationError::Parse(e.to_string()),
            other => CommunicationError::Remote {
                status: 500,
                message: other.to_string(),
            },
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
