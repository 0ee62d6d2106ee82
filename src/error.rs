//! Error types for the admission engine.
//!
//! `Error` covers infrastructure failures (API server, registry, hooks,
//! certificates). `AdmissionError` classifies what goes back to the API
//! server when a request cannot be decided; it is never a denial.

use axum::http::StatusCode;
use thiserror::Error;

/// Error type for infrastructure operations and scheduled side effects
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate generation or parsing failed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Object was created concurrently by someone else
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency conflict on update
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Object does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Container registry error
    #[error("Registry error: {0}")]
    Registry(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Platform hook rejected the call
    #[error("Hook error: {0}")]
    Hook(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
            || matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error indicates a create raced with another writer
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::AlreadyExists(_))
            || matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409 && e.reason == "AlreadyExists")
    }

    /// Check if this error indicates a stale resource version on update
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
            || matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409 && e.reason == "Conflict")
    }
}

/// Result type alias for infrastructure operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failure to decide an admission request.
///
/// The webhook is registered with failure policy `Ignore`, so every variant
/// results in the original operation proceeding unmodified.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Malformed review or object bytes
    #[error("invalid admission request: {0}")]
    Protocol(String),

    /// Marshal failure or unexpected state while building a patch
    #[error("internal error: {0}")]
    Internal(String),

    /// Mutator did not finish within the admission budget
    #[error("admission timed out after {0}ms")]
    Timeout(u128),
}

impl AdmissionError {
    /// HTTP status returned to the API server
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::Protocol(_) => StatusCode::BAD_REQUEST,
            AdmissionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Short label used in metrics
    pub fn label(&self) -> &'static str {
        match self {
            AdmissionError::Protocol(_) => "protocol_error",
            AdmissionError::Internal(_) => "internal_error",
            AdmissionError::Timeout(_) => "timeout",
        }
    }
}

impl From<Error> for AdmissionError {
    fn from(e: Error) -> Self {
        match e {
            Error::Serialization(e) => AdmissionError::Internal(e.to_string()),
            other => AdmissionError::Internal(other.to_string()),
        }
    }
}
