use thiserror::Error;

/// Errors surfaced at the dispatcher boundary.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Request validation failed before any backend, cache, or ledger I/O occurred.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A specifically requested backend is disabled or its breaker is open.
    #[error("backend '{0}' is unavailable")]
    BackendUnavailable(String),

    /// A single backend call exceeded its deadline.
    #[error("backend '{backend}' timed out after {elapsed_ms}ms")]
    Timeout { backend: String, elapsed_ms: u64 },

    /// The caller cancelled the request.
    #[error("request was cancelled")]
    Cancelled,

    /// The remote returned a non-retryable semantic error.
    #[error("backend '{backend}' returned an error: {message}")]
    BackendError { backend: String, message: String },

    /// A network or 5xx error from a single backend.
    #[error("backend '{backend}' had a transient error: {message}")]
    TransientBackendError { backend: String, message: String },

    /// Every candidate in the fallback loop failed.
    #[error("all backends failed: {0:?}")]
    AllBackendsFailed(Vec<(String, String)>),

    /// The ledger/cache store is unavailable.
    #[error("storage error: {0}")]
    StorageError(String),
}

/// The narrow error set a [`Backend`](crate::backend::Backend) is allowed to
/// return. The router widens these into [`RouterError`].
#[derive(Error, Debug, Clone)]
pub enum AdapterError {
    #[error("timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("backend error: {0}")]
    BackendError(String),

    #[error("transient error: {0}")]
    TransientBackendError(String),

    #[error("cancelled")]
    Cancelled,
}

impl AdapterError {
    /// `true` for error kinds the router counts against a backend's circuit breaker.
    ///
    /// `BackendError` does not count by default — a malformed-request or
    /// content-policy rejection says nothing about the backend's health.
    pub fn counts_as_breaker_failure(&self) -> bool {
        matches!(
            self,
            AdapterError::Timeout { .. } | AdapterError::TransientBackendError(_)
        )
    }

    pub fn into_router_error(self, backend: &str) -> RouterError {
        match self {
            AdapterError::Timeout { elapsed_ms } => RouterError::Timeout {
                backend: backend.to_string(),
                elapsed_ms,
            },
            AdapterError::BackendError(message) => RouterError::BackendError {
                backend: backend.to_string(),
                message,
            },
            AdapterError::TransientBackendError(message) => RouterError::TransientBackendError {
                backend: backend.to_string(),
                message,
            },
            AdapterError::Cancelled => RouterError::Cancelled,
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;
