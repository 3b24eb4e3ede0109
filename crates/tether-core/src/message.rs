//! The structured value exchanged with device services.
//!
//! Every request and response on the wire is a [`Message`]: a plist-style
//! union of dictionaries, arrays and scalars. Dictionaries keep insertion
//! order for encoding, but two dictionaries holding the same entries
//! compare equal regardless of the order they were built in.

use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// An ordered mapping of string keys to messages.
pub type Dictionary = IndexMap<String, Message>;

/// A structured message value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Message {
    /// Mapping of unique string keys to values.
    Dictionary(Dictionary),
    /// Ordered sequence of values.
    Array(Vec<Message>),
    /// UTF-8 string.
    String(String),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Floating point number.
    Real(f64),
    /// Boolean flag.
    Boolean(bool),
    /// Opaque byte blob.
    Binary(Vec<u8>),
    /// Point in time.
    Date(DateTime<Utc>),
    /// Explicit absence of a value.
    Null,
}

/// The variant of a [`Message`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Dictionary,
    Array,
    String,
    Integer,
    Real,
    Boolean,
    Binary,
    Date,
    Null,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Dictionary => "dictionary",
            Self::Array => "array",
            Self::String => "string",
            Self::Integer => "integer",
            Self::Real => "real",
            Self::Boolean => "boolean",
            Self::Binary => "binary",
            Self::Date => "date",
            Self::Null => "null",
        };
        f.write_str(name)
    }
}

impl Message {
    /// Creates an empty dictionary message.
    pub fn dictionary() -> Self {
        Self::Dictionary(Dictionary::new())
    }

    /// Creates a dictionary from `(key, value)` pairs.
    ///
    /// Later pairs replace earlier ones with the same key.
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Message>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Dictionary(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Creates an array of strings.
    pub fn string_array<S, I>(items: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = S>,
    {
        Self::Array(items.into_iter().map(|s| Self::String(s.into())).collect())
    }

    /// Returns the variant of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Dictionary(_) => MessageKind::Dictionary,
            Self::Array(_) => MessageKind::Array,
            Self::String(_) => MessageKind::String,
            Self::Integer(_) => MessageKind::Integer,
            Self::Real(_) => MessageKind::Real,
            Self::Boolean(_) => MessageKind::Boolean,
            Self::Binary(_) => MessageKind::Binary,
            Self::Date(_) => MessageKind::Date,
            Self::Null => MessageKind::Null,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            Self::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_dictionary_mut(&mut self) -> Option<&mut Dictionary> {
        match self {
            Self::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn into_dictionary(self) -> Option<Dictionary> {
        match self {
            Self::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Message]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Message>> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as an unsigned integer, if it is a non-negative integer.
    pub fn as_unsigned(&self) -> Option<u64> {
        self.as_integer().and_then(|i| u64::try_from(i).ok())
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Self::Real(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Looks up `key` when this message is a dictionary.
    pub fn get(&self, key: &str) -> Option<&Message> {
        self.as_dictionary().and_then(|d| d.get(key))
    }

    /// Looks up `key` and returns it as a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Message::as_str)
    }
}

impl From<Dictionary> for Message {
    fn from(value: Dictionary) -> Self {
        Self::Dictionary(value)
    }
}

impl From<Vec<Message>> for Message {
    fn from(value: Vec<Message>) -> Self {
        Self::Array(value)
    }
}

impl From<String> for Message {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<&str> for Message {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<i64> for Message {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Message {
    fn from(value: i32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<u32> for Message {
    fn from(value: u32) -> Self {
        Self::Integer(i64::from(value))
    }
}

impl From<f64> for Message {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<bool> for Message {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<Vec<u8>> for Message {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<&[u8]> for Message {
    fn from(value: &[u8]) -> Self {
        Self::Binary(value.to_vec())
    }
}

impl From<DateTime<Utc>> for Message {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Date(value)
    }
}

impl<T: Into<Message>> From<Option<T>> for Message {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}
