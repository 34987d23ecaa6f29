use thiserror::Error;

/// Result type for cast operations
pub type Result<T> = std::result::Result<T, CastError>;

/// Errors that can occur when talking to a cast receiver
#[derive(Error, Debug)]
pub enum CastError {
    /// I/O error on the device socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS negotiation or transfer error
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Connection was closed or torn down
    #[error("Connection closed")]
    ConnectionClosed,

    /// The outbound ring buffer has no room for the message
    #[error("Send buffer full")]
    SendBufferFull,

    /// The message can never fit the outbound ring buffer
    #[error("Message too large: {size} bytes")]
    MessageTooLarge {
        /// Encoded frame size in bytes
        size: usize,
    },

    /// A request of the same kind is already outstanding
    #[error("Request already in flight: {kind}")]
    RequestInFlight {
        /// Operation kind that is already tracked
        kind: &'static str,
    },

    /// Request timed out waiting for the receiver
    #[error("Request timeout")]
    Timeout,

    /// The operation is not valid in the current connection state
    #[error("Not connected")]
    NotConnected,

    /// The receiver rejected the request
    #[error("Receiver error: {detail}")]
    ReceiverError {
        /// Reason string reported by the receiver
        detail: String,
    },

    /// A frame on the wire violated the framing rules
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid or unexpected message from the receiver
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Channel receive error
    #[error("Channel error: {0}")]
    ChannelError(String),
}
