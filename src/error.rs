use std::sync::Arc;

/// Represents a result type for fallible operations in the GrowthBook SDK.
///
/// Evaluation itself never returns this type: feature and experiment evaluation is total and
/// always produces a value. Errors only surface from network, storage, and construction-time
/// misuse.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the GrowthBook SDK.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A network call was requested but no client key has been configured.
    #[error("client_key is required to fetch features")]
    MissingClientKey,

    /// Invalid api_host or streaming_host configuration.
    #[error("invalid api_host configuration")]
    InvalidApiHost(#[source] url::ParseError),

    /// The server responded with a non-success status code.
    #[error("HTTP error: {0}")]
    HttpStatus(u16),

    /// The fetch did not complete before the call-site timeout. The underlying request keeps
    /// running and still populates the cache.
    #[error("timed out waiting for features")]
    Timeout,

    /// The background task fetching features panicked or was cancelled.
    #[error("background fetch task failed")]
    FetchTaskFailed,

    /// Payload could not be decoded.
    #[error("invalid payload: {0}")]
    Json(Arc<serde_json::Error>),

    /// A storage backend failed to read or write.
    #[error("storage error: {0}")]
    Storage(String),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Json(Arc::new(value))
    }
}
