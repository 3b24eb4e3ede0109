//! Client error types and their mapping to a uniform result.

use std::fmt;
use std::io;

use tether_core::OptionsError;
use tether_protocol::{ProtocolError, StatusError};
use thiserror::Error;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// The failure taxonomy every operation reports against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or missing input, detected before any I/O.
    InvalidArgument,
    /// Operation attempted on a closed or busy session.
    InvalidState,
    /// Transport failure: connect, reset, timeout, partial message.
    CommunicationError,
    /// Bytes that do not decode, or a message of the wrong container kind.
    ProtocolError,
    /// Peer speaks a newer protocol than requested.
    ProtocolVersionMismatch,
    /// A specific acknowledgement was required but something else arrived.
    UnexpectedReply,
    /// Peer reported failure in its terminal status.
    RemoteOperationFailed,
    /// Peer does not recognize the requested action.
    OperationUnsupported,
}

impl ErrorKind {
    /// Native-style status code for this kind; `0` is reserved for success.
    pub fn status_code(&self) -> i32 {
        match self {
            Self::InvalidArgument => -1,
            Self::ProtocolError => -2,
            Self::CommunicationError => -3,
            Self::InvalidState => -4,
            Self::RemoteOperationFailed => -5,
            Self::ProtocolVersionMismatch => -6,
            Self::UnexpectedReply => -7,
            Self::OperationUnsupported => -8,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Errors that can occur in the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The connection went away. `locally` is set when this session's own
    /// `close` caused it.
    #[error("connection closed by {}", closer(.locally))]
    ConnectionClosed { locally: bool },

    #[error("timeout during {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[source] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[source] ProtocolError),

    #[error("protocol version mismatch: requested {local}, device reports {remote}")]
    ProtocolVersionMismatch { local: String, remote: String },

    #[error("unexpected reply: expected {expected}, received {received}")]
    UnexpectedReply { expected: String, received: String },

    #[error("remote operation failed: {0}")]
    RemoteOperationFailed(StatusError),

    #[error("operation unsupported: {0}")]
    OperationUnsupported(String),
}

fn closer(locally: &bool) -> &'static str {
    if *locally { "session close" } else { "peer" }
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::ConnectionFailed(_)
            | Self::ConnectionClosed { .. }
            | Self::Timeout(_)
            | Self::Io(_) => ErrorKind::CommunicationError,
            Self::Protocol(_) => ErrorKind::ProtocolError,
            Self::ProtocolVersionMismatch { .. } => ErrorKind::ProtocolVersionMismatch,
            Self::UnexpectedReply { .. } => ErrorKind::UnexpectedReply,
            Self::RemoteOperationFailed(_) => ErrorKind::RemoteOperationFailed,
            Self::OperationUnsupported(_) => ErrorKind::OperationUnsupported,
        }
    }

    pub fn status_code(&self) -> i32 {
        self.kind().status_code()
    }

    /// True when the session's own `close` ended the exchange.
    pub fn is_local_close(&self) -> bool {
        matches!(self, Self::ConnectionClosed { locally: true })
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn unexpected_reply(expected: impl Into<String>, received: impl Into<String>) -> Self {
        Self::UnexpectedReply {
            expected: expected.into(),
            received: received.into(),
        }
    }

    /// Maps an error embedded in a peer status.
    ///
    /// An unknown command is reported as unsupported rather than failed.
    pub fn from_status(error: StatusError) -> Self {
        match error.name.as_deref() {
            Some("UnknownCommand") | Some("UnsupportedCommand") => Self::OperationUnsupported(
                error
                    .description
                    .clone()
                    .unwrap_or_else(|| error.to_string()),
            ),
            _ => Self::RemoteOperationFailed(error),
        }
    }

    /// Describes this error as a status error, for delivery through a
    /// status callback.
    pub fn to_status_error(&self) -> StatusError {
        match self {
            Self::RemoteOperationFailed(error) => error.clone(),
            other => StatusError {
                name: Some(other.kind().to_string()),
                description: Some(other.to_string()),
                code: None,
            },
        }
    }
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ConnectionClosed => Self::ConnectionClosed { locally: false },
            ProtocolError::Io(e) => Self::Io(e),
            // A frame cut short is a transport failure, not a bad payload.
            ProtocolError::IncompleteFrame { expected, received } => Self::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("partial message: expected {expected} bytes, got {received}"),
            )),
            other => Self::Protocol(other),
        }
    }
}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<OptionsError> for ClientError {
    fn from(err: OptionsError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

/// Exception-style wrapper: the same failure tag plus a formatted message.
///
/// For call sites that would rather propagate one opaque error value than
/// match on [`ClientError`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceException {
    pub service: String,
    pub kind: ErrorKind,
    pub code: i32,
    pub message: String,
}

impl ServiceException {
    pub fn new(service: impl Into<String>, error: &ClientError) -> Self {
        let service = service.into();
        let kind = error.kind();
        let code = kind.status_code();
        Self {
            message: format!("A {service} error occurred. The error code was {code} ({kind}): {error}"),
            service,
            kind,
            code,
        }
    }
}

impl From<ClientError> for ServiceException {
    fn from(error: ClientError) -> Self {
        Self::new("device service", &error)
    }
}

/// Converts a result into the exception-style convention.
pub trait OrException<T> {
    fn or_exception(self, service: &str) -> Result<T, ServiceException>;
}

impl<T> OrException<T> for ClientResult<T> {
    fn or_exception(self, service: &str) -> Result<T, ServiceException> {
        self.map_err(|e| ServiceException::new(service, &e))
    }
}
