use thiserror::Error;

/// Error taxonomy shared by every trellis crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrellisError {
    /// Required input missing or malformed; raised before storage is touched.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// A domain rule refused the operation.
    #[error("conflict: {0}")]
    Conflict(String),
    /// The store rejected a statement or a write affected no rows.
    #[error("storage error: {0}")]
    Storage(String),
}

impl TrellisError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }
}

impl From<serde_json::Error> for TrellisError {
    fn from(err: serde_json::Error) -> Self {
        Self::Storage(format!("json: {err}"))
    }
}

pub type Result<T, E = TrellisError> = std::result::Result<T, E>;
