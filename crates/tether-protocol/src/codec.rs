//! Payload encoding: [`Message`] to and from wire bytes.
//!
//! Device services speak XML or binary plists. Plists have no null, so a
//! dictionary entry holding [`Message::Null`] is left out when encoding
//! (the service reads a missing key the same way), and a null anywhere
//! else cannot be encoded. The JSON format is lossless and meant for
//! debugging and test peers.

use std::io::Cursor;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{Dictionary, Message};

use crate::error::{ProtocolError, ProtocolResult};

/// Payload encoding used inside each frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// XML property list.
    #[default]
    Xml,
    /// Binary property list (`bplist00`).
    Binary,
    /// JSON rendering of [`Message`].
    Json,
}

impl WireFormat {
    /// Encodes a message into a payload.
    pub fn encode(&self, message: &Message) -> ProtocolResult<Vec<u8>> {
        match self {
            Self::Xml => {
                let mut buf = Vec::new();
                to_plist(message)?.to_writer_xml(&mut buf)?;
                Ok(buf)
            }
            Self::Binary => {
                let mut buf = Vec::new();
                to_plist(message)?.to_writer_binary(&mut buf)?;
                Ok(buf)
            }
            Self::Json => Ok(serde_json::to_vec(message)?),
        }
    }

    /// Decodes a payload into a message.
    ///
    /// Both plist formats accept either plist encoding, since devices are
    /// free to answer binary to an XML request.
    pub fn decode(&self, payload: &[u8]) -> ProtocolResult<Message> {
        match self {
            Self::Xml | Self::Binary => {
                let value = plist::Value::from_reader(Cursor::new(payload))?;
                from_plist(value)
            }
            Self::Json => Ok(serde_json::from_slice(payload)?),
        }
    }
}

/// Converts a message into a plist value.
pub fn to_plist(message: &Message) -> ProtocolResult<plist::Value> {
    let value = match message {
        Message::Dictionary(entries) => {
            let mut dict = plist::Dictionary::new();
            for (key, value) in entries {
                if value.is_null() {
                    continue;
                }
                dict.insert(key.clone(), to_plist(value)?);
            }
            plist::Value::Dictionary(dict)
        }
        Message::Array(items) => plist::Value::Array(
            items
                .iter()
                .map(to_plist)
                .collect::<ProtocolResult<Vec<_>>>()?,
        ),
        Message::String(s) => plist::Value::String(s.clone()),
        Message::Integer(i) => plist::Value::Integer((*i).into()),
        Message::Real(r) => plist::Value::Real(*r),
        Message::Boolean(b) => plist::Value::Boolean(*b),
        Message::Binary(bytes) => plist::Value::Data(bytes.clone()),
        Message::Date(date) => plist::Value::Date(SystemTime::from(*date).into()),
        Message::Null => {
            return Err(ProtocolError::Unrepresentable(
                "null outside of a dictionary entry".to_string(),
            ));
        }
    };
    Ok(value)
}

/// Converts a plist value into a message.
pub fn from_plist(value: plist::Value) -> ProtocolResult<Message> {
    let message = match value {
        plist::Value::Dictionary(dict) => {
            let mut entries = Dictionary::with_capacity(dict.len());
            for (key, value) in dict {
                entries.insert(key, from_plist(value)?);
            }
            Message::Dictionary(entries)
        }
        plist::Value::Array(items) => Message::Array(
            items
                .into_iter()
                .map(from_plist)
                .collect::<ProtocolResult<Vec<_>>>()?,
        ),
        plist::Value::String(s) => Message::String(s),
        plist::Value::Integer(i) => match i.as_signed() {
            Some(signed) => Message::Integer(signed),
            None => {
                return Err(ProtocolError::Unrepresentable(format!(
                    "integer {i:?} exceeds 64-bit signed range"
                )));
            }
        },
        plist::Value::Real(r) => Message::Real(r),
        plist::Value::Boolean(b) => Message::Boolean(b),
        plist::Value::Data(bytes) => Message::Binary(bytes),
        plist::Value::Date(date) => Message::Date(DateTime::<Utc>::from(SystemTime::from(date))),
        plist::Value::Uid(uid) => match i64::try_from(uid.get()) {
            Ok(id) => Message::Integer(id),
            Err(_) => {
                return Err(ProtocolError::Unrepresentable(format!(
                    "uid {} exceeds 64-bit signed range",
                    uid.get()
                )));
            }
        },
        other => {
            return Err(ProtocolError::Unrepresentable(format!(
                "unsupported plist value: {other:?}"
            )));
        }
    };
    Ok(message)
}
