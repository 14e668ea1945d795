use agora_shared::Reason;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Document (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The persisted document exists but cannot be interpreted at all.
    #[error("Corrupt store document: {0}")]
    CorruptDocument(String),

    /// Backend failure that is not an SQLite error (poisoned lock, join error).
    #[error("Backend error: {0}")]
    Backend(String),

    /// The referenced record does not exist.
    #[error("Record not found")]
    NotFound,

    /// The caller may not perform this operation on the record.
    #[error("Permission denied")]
    PermissionDenied,

    /// A bounded collection is full.
    #[error("Limit reached")]
    LimitReached,

    /// A token or code is past its expiry.
    #[error("Expired")]
    Expired,

    /// Input rejected before touching state.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A uniqueness constraint would be violated.
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Reason code to surface to a client, or `None` for infrastructure
    /// failures that must stay server-side.
    pub fn reason(&self) -> Option<Reason> {
        match self {
            StoreError::NotFound => Some(Reason::NotFound),
            StoreError::PermissionDenied => Some(Reason::PermissionDenied),
            StoreError::LimitReached => Some(Reason::LimitReached),
            StoreError::Expired => Some(Reason::Expired),
            StoreError::Validation(_) => Some(Reason::ValidationFailed),
            StoreError::Conflict(_) => Some(Reason::Conflict),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
