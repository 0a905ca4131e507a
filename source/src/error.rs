use thiserror::Error;

/// Convenient result type for source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors returned by a [`crate::client::SourceClient`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    /// The source could not be reached.
    #[error("source connection failed: {0}")]
    Connection(String),

    /// The source rejected the request because of its rate limits.
    #[error("request throttled by the source: {0}")]
    Throttled(String),

    /// The requested table does not exist.
    #[error("table `{0}` not found")]
    TableNotFound(String),

    /// The requested stream does not exist.
    #[error("stream `{0}` not found")]
    StreamNotFound(String),

    /// The requested shard does not exist in the stream.
    #[error("shard `{shard_id}` not found in stream `{stream_id}`")]
    ShardNotFound { stream_id: String, shard_id: String },

    /// The cursor is malformed, or points to data the stream no longer retains.
    #[error("shard cursor `{0}` is invalid or expired")]
    ExpiredCursor(String),

    /// The request was malformed.
    #[error("invalid request: {0}")]
    Validation(String),

    /// Any other service-side failure.
    #[error("source service error: {0}")]
    Service(String),
}

impl SourceError {
    /// Returns `true` for failures that are expected to go away on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::Connection(_) | SourceError::Throttled(_) | SourceError::Service(_)
        )
    }
}
