//! Shared error type used across all ToolBroker crates.
//!
//! Every failure is classified into one of the semantic kinds below. The
//! kind drives two decisions at the edges: whether a caller may retry
//! (`is_retryable`) and which wire code the client sees (`code`).

/// Shared error type used across all ToolBroker crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Bad config or request shape. Surfaced as a 4xx-equivalent.
    #[error("validation: {0}")]
    Validation(String),

    /// Duplicate name, existing lock holder, or state mismatch.
    #[error("conflict: {0}")]
    Conflict(String),

    /// No such server, session, call, or tool.
    #[error("not found: {0}")]
    NotFound(String),

    /// A lock was held by someone else. Retryable.
    #[error("contention: {0}")]
    Contention(String),

    /// Queue full or too many concurrent requests. Retryable.
    #[error("backpressure: {0}")]
    Backpressure(String),

    /// Upstream 5xx, connection refused, or timeout. Retryable with backoff.
    #[error("transient upstream failure: {0}")]
    TransientExternal(String),

    /// Upstream 4xx that is not retryable.
    #[error("upstream failure: {0}")]
    PermanentExternal(String),

    /// Parse error, schema mismatch, or protocol framing error. Fatal to
    /// the affected stream; the connection must be re-established.
    #[error("integrity: {0}")]
    Integrity(String),

    /// Cooperative cancellation from a cancellation token.
    #[error("cancelled")]
    Cancelled,

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether a caller may retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Contention(_) | Error::Backpressure(_) | Error::TransientExternal(_) | Error::Io(_)
        )
    }

    /// Stable wire code carried in `error({code, message})` client events.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation",
            Error::Conflict(_) => "conflict",
            Error::NotFound(_) => "not_found",
            Error::Contention(_) => "contention",
            Error::Backpressure(_) => "backpressure",
            Error::TransientExternal(_) | Error::Io(_) => "transient",
            Error::PermanentExternal(_) => "upstream",
            Error::Integrity(_) | Error::Json(_) => "integrity",
            Error::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
