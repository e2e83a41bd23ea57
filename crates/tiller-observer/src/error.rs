//! Observer error types.

/// Unified error type for the observer crate.
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    /// A line could not be decoded as an event.
    #[error("event decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Reading from the underlying transport failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The source closed before a terminal event and the reconnect
    /// policy gave up.
    #[error("stream closed before the run reached a terminal state")]
    StreamClosed,
}

/// Convenience alias used throughout the observer crate.
pub type Result<T> = std::result::Result<T, ObserverError>;
