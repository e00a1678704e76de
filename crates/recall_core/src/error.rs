//! Error types for collection, media and session storage.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum CoreError {
    /// SQLite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Incremental sync is impossible against this collection.
    #[error("schema lock: {0}")]
    SchemaLock(String),

    /// The collection file failed validation.
    #[error("corrupt collection: {0}")]
    Corrupt(String),

    /// The data root is held by another server process.
    #[error("data root is locked by another process")]
    RootLocked,

    /// A row did not match the table descriptor.
    #[error("invalid row data: {0}")]
    InvalidData(String),

    /// A media batch archive could not be decoded.
    #[error("invalid media archive: {0}")]
    InvalidArchive(String),

    /// A media filename failed normalization.
    #[error("invalid media filename: {0}")]
    InvalidFilename(String),

    /// The identity gateway could not be reached.
    #[error("identity gateway unavailable: {0}")]
    GatewayUnavailable(String),
}

impl CoreError {
    /// True when the fault lies with the request rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            CoreError::SchemaLock(_)
                | CoreError::Corrupt(_)
                | CoreError::InvalidData(_)
                | CoreError::InvalidArchive(_)
                | CoreError::InvalidFilename(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(CoreError::InvalidData("x".into()).is_client_error());
        assert!(!CoreError::RootLocked.is_client_error());
        assert!(!CoreError::GatewayUnavailable("down".into()).is_client_error());
    }

    #[test]
    fn display_carries_context() {
        let err = CoreError::SchemaLock("scm changed".into());
        assert!(err.to_string().contains("scm changed"));
    }
}
