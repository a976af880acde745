//! Error types for the tether host bridge.

/// Top-level error type for the host bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Configuration file or value error.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed or unsupported wire envelope / payload.
    #[error("contract error: {0}")]
    Contract(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Settings persistence error.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Provider collaborator failed to produce a stream.
    #[error("provider error: {0}")]
    Provider(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Failure to deliver a message to a request's response channel.
///
/// Delivery failures are never retried: the remote end is assumed gone.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// No live request entry exists for the identifier.
    #[error("no live request registered for `{0}`")]
    NotRegistered(String),

    /// The channel behind the request was closed by the receiver.
    #[error("response channel for `{0}` is closed")]
    ChannelClosed(String),

    /// The receiver is not keeping up and its buffer is full.
    #[error("response channel for `{0}` is full")]
    Full(String),
}
