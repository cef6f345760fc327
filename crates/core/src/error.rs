//! Unified error types for apicache.

use tokio_rusqlite::rusqlite;

/// Unified error types for the cache and limiter core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., a zero batch size).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Client name or derived table name is not a safe identifier.
    #[error("INVALID_IDENTIFIER: {0}")]
    InvalidIdentifier(String),

    /// Request parameters contain a value that cannot be hashed deterministically.
    #[error("UNSUPPORTED_TYPE: {0}")]
    UnsupportedType(String),

    /// Request parameters nest deeper than the normalizer allows.
    #[error("DEPTH_EXCEEDED: parameters nest deeper than {0} levels")]
    DepthExceeded(usize),

    /// JSON encoding failed.
    #[error("ENCODING_FAILURE: {0}")]
    EncodingFailure(String),

    /// JSON or UTF-8 decoding of a stored payload failed.
    #[error("DECODING_FAILURE: {0}")]
    DecodingFailure(String),

    /// gzip compression or decompression failed.
    #[error("COMPRESSION_FAILURE: {0}")]
    CompressionFailure(String),

    /// A field required for storage is absent or empty.
    #[error("MISSING_REQUIRED_FIELD: {0}")]
    MissingRequiredField(String),

    /// The client has no attempts left in the current window.
    #[error("RATE_LIMIT_EXCEEDED: {client} (available in {available_in}s)")]
    RateLimitExceeded { client: String, available_in: u64 },

    /// The caller-supplied network call failed before producing a response.
    #[error("DISPATCH_FAILED: {0}")]
    Dispatch(String),

    /// Database operation failed.
    #[error("CACHE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("CACHE_ERROR: migration failed: {0}")]
    MigrationFailed(String),
}

impl Error {
    /// Whether the caller can retry the same request later.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::RateLimitExceeded { .. })
    }
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::Database(tokio_rusqlite::Error::ConnectionClosed),
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        Error::Database(err)
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}
