use flowcore::{status, Output};
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Key \"{0}\" not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Gone(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unsupported(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    /// A transaction function rejected the update with its own output
    #[error("{0}")]
    Aborted(Output),
}

impl StoreError {
    pub fn status_code(&self) -> u16 {
        match self {
            StoreError::NotFound(_) => status::NOT_FOUND,
            StoreError::Conflict(_) => status::CONFLICT,
            StoreError::Gone(_) => status::GONE,
            StoreError::BadRequest(_) => status::BAD_REQUEST,
            StoreError::Unsupported(_) => status::NOT_IMPLEMENTED,
            StoreError::Backend(_) => status::INTERNAL_SERVER_ERROR,
            StoreError::Aborted(output) => output.status_code(),
        }
    }

    pub(crate) fn unsupported(backend: &str, operation: &str) -> Self {
        StoreError::Unsupported(format!("{} is not supported by {} namespaces", operation, backend))
    }
}

impl From<StoreError> for Output {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Aborted(output) => output,
            other => Output::error(other.status_code(), other.to_string()),
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
