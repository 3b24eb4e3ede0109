//! Protocol error types.

use tether_core::MessageKind;
use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors raised while framing, encoding or decoding messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds the configured maximum size.
    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: u32 },

    /// A zero-length frame was received.
    #[error("empty frame")]
    EmptyFrame,

    /// The stream ended in the middle of a frame.
    #[error("incomplete frame: expected {expected} bytes, got {received}")]
    IncompleteFrame { expected: usize, received: usize },

    /// The peer closed the stream between frames.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Plist encoding or decoding failed.
    #[error("plist codec failed: {0}")]
    Plist(#[from] plist::Error),

    /// JSON encoding or decoding failed.
    #[error("json codec failed: {0}")]
    Json(#[from] serde_json::Error),

    /// The value cannot be expressed in the selected wire format.
    #[error("value not representable on the wire: {0}")]
    Unrepresentable(String),

    /// A message did not have the container kind the protocol requires.
    #[error("expected {expected}, got {actual}")]
    UnexpectedKind {
        expected: &'static str,
        actual: MessageKind,
    },

    /// A DeviceLink envelope was malformed.
    #[error("malformed DeviceLink message: {0}")]
    MalformedEnvelope(String),

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns true for errors caused by the transport rather than the payload.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::ConnectionClosed | Self::IncompleteFrame { .. } | Self::Io(_)
        )
    }

    pub(crate) fn unexpected_kind(expected: &'static str, actual: MessageKind) -> Self {
        Self::UnexpectedKind { expected, actual }
    }
}
