//! DeviceLink envelopes.
//!
//! Backup-style services wrap every payload in an array whose first element
//! names the message: `["DLMessageProcessMessage", {...}]`. The session
//! opens with a version exchange driven by the device.

use tether_core::{Dictionary, Message};

use crate::error::{ProtocolError, ProtocolResult};

pub const DL_VERSION_EXCHANGE: &str = "DLMessageVersionExchange";
pub const DL_VERSIONS_OK: &str = "DLVersionsOk";
pub const DL_DEVICE_READY: &str = "DLMessageDeviceReady";
pub const DL_PROCESS_MESSAGE: &str = "DLMessageProcessMessage";
pub const DL_DISCONNECT: &str = "DLMessageDisconnect";

/// Placeholder the device expects when a disconnect has no reason.
pub const EMPTY_PARAMETER: &str = "___EmptyParameterString___";

/// A decoded DeviceLink message.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceLinkMessage {
    /// Device announces its protocol version.
    VersionExchange { major: u64, minor: u64 },
    /// Host accepts the version exchange.
    VersionsOk { major: u64 },
    /// Device finished the handshake.
    DeviceReady,
    /// Service payload.
    Process(Dictionary),
    /// Either side is closing the link.
    Disconnect(String),
    /// Any other named message, kept for forward compatibility.
    Other { name: String, args: Vec<Message> },
}

impl DeviceLinkMessage {
    /// Returns the envelope name (first array element).
    pub fn name(&self) -> &str {
        match self {
            Self::VersionExchange { .. } | Self::VersionsOk { .. } => DL_VERSION_EXCHANGE,
            Self::DeviceReady => DL_DEVICE_READY,
            Self::Process(_) => DL_PROCESS_MESSAGE,
            Self::Disconnect(_) => DL_DISCONNECT,
            Self::Other { name, .. } => name,
        }
    }

    /// Encodes the envelope as an array message.
    pub fn to_message(&self) -> Message {
        let name = Message::from(self.name());
        let items = match self {
            Self::VersionExchange { major, minor } => {
                vec![name, unsigned(*major), unsigned(*minor)]
            }
            Self::VersionsOk { major } => vec![name, Message::from(DL_VERSIONS_OK), unsigned(*major)],
            Self::DeviceReady => vec![name],
            Self::Process(payload) => vec![name, Message::Dictionary(payload.clone())],
            Self::Disconnect(reason) => {
                let reason = if reason.is_empty() {
                    EMPTY_PARAMETER
                } else {
                    reason.as_str()
                };
                vec![name, Message::from(reason)]
            }
            Self::Other { args, .. } => {
                let mut items = vec![name];
                items.extend(args.iter().cloned());
                items
            }
        };
        Message::Array(items)
    }

    /// Decodes an array message into an envelope.
    pub fn parse(message: &Message) -> ProtocolResult<Self> {
        let items = message
            .as_array()
            .ok_or_else(|| ProtocolError::unexpected_kind("DeviceLink array", message.kind()))?;
        let (first, args) = items
            .split_first()
            .ok_or_else(|| ProtocolError::MalformedEnvelope("empty array".to_string()))?;
        let name = first
            .as_str()
            .ok_or_else(|| ProtocolError::MalformedEnvelope("message name is not a string".to_string()))?;

        let parsed = match name {
            DL_VERSION_EXCHANGE => match args {
                [Message::String(ok), major, ..] if ok == DL_VERSIONS_OK => Self::VersionsOk {
                    major: version_number(major)?,
                },
                [major, minor, ..] => Self::VersionExchange {
                    major: version_number(major)?,
                    minor: version_number(minor)?,
                },
                _ => {
                    return Err(ProtocolError::MalformedEnvelope(
                        "version exchange without versions".to_string(),
                    ));
                }
            },
            DL_DEVICE_READY => Self::DeviceReady,
            DL_PROCESS_MESSAGE => match args.first() {
                Some(Message::Dictionary(payload)) => Self::Process(payload.clone()),
                Some(other) => {
                    return Err(ProtocolError::unexpected_kind("process payload dictionary", other.kind()));
                }
                None => {
                    return Err(ProtocolError::MalformedEnvelope(
                        "process message without payload".to_string(),
                    ));
                }
            },
            DL_DISCONNECT => {
                let reason = args
                    .first()
                    .and_then(Message::as_str)
                    .filter(|r| *r != EMPTY_PARAMETER)
                    .unwrap_or_default();
                Self::Disconnect(reason.to_string())
            }
            other => Self::Other {
                name: other.to_string(),
                args: args.to_vec(),
            },
        };
        Ok(parsed)
    }
}

fn unsigned(value: u64) -> Message {
    Message::Integer(i64::try_from(value).unwrap_or(i64::MAX))
}

fn version_number(value: &Message) -> ProtocolResult<u64> {
    value
        .as_unsigned()
        .ok_or_else(|| ProtocolError::MalformedEnvelope(format!("invalid version number: {value:?}")))
}
