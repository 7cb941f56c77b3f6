use std::time::Duration;

/// Core error type for the gateway.
///
/// Adapter crates should map their specific errors into this type so the core
/// can handle failures consistently (user-facing message vs abort vs retry).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("security violation: {0}")]
    Security(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {status}: {body}")]
    Http { status: u16, body: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("external error: {0}")]
    External(String),
}

pub type Result<T> = std::result::Result<T, Error>;
