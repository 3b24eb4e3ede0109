//! Status messages streamed by long-running service operations.
//!
//! The extraction helpers are pure functions over a [`Message`]: a missing
//! key yields the documented sentinel, never an error.

use tether_core::{Dictionary, Message};

use crate::error::{ProtocolError, ProtocolResult};

/// Value of `Status` on the final message of a successful operation.
pub const STATUS_COMPLETE: &str = "Complete";

/// Percent value reported when a status carries no progress.
pub const PERCENT_UNKNOWN: i32 = -1;

const KEY_COMMAND: &str = "Command";
const KEY_STATUS: &str = "Status";
const KEY_PERCENT: &str = "PercentComplete";
const KEY_TOTAL: &str = "Total";
const KEY_CURRENT_INDEX: &str = "CurrentIndex";
const KEY_CURRENT_AMOUNT: &str = "CurrentAmount";
const KEY_CURRENT_LIST: &str = "CurrentList";
const KEY_ERROR: &str = "Error";
const KEY_ERROR_DESCRIPTION: &str = "ErrorDescription";
const KEY_ERROR_DETAIL: &str = "ErrorDetail";
const KEY_ERROR_CODE: &str = "ErrorCode";

/// An error embedded in a status message by the remote service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusError {
    /// Symbolic error name, e.g. `APIInternalError`.
    pub name: Option<String>,
    /// Human-readable description.
    pub description: Option<String>,
    /// Numeric detail code.
    pub code: Option<u64>,
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name.as_deref().unwrap_or("UnknownError"))?;
        if let Some(description) = &self.description {
            write!(f, ": {description}")?;
        }
        if let Some(code) = self.code {
            write!(f, " (code {code})")?;
        }
        Ok(())
    }
}

/// Item progress of a paged browse response.
///
/// Counters are zero and `list` is `None` when the status carries no paging
/// information.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemProgress {
    pub total: u64,
    pub current_index: u64,
    pub current_amount: u64,
    pub list: Option<Vec<Message>>,
}

/// Reads the `Command` name of a request dictionary.
pub fn command_get_name(command: &Message) -> Option<&str> {
    command.get_str(KEY_COMMAND)
}

/// Reads the `Status` name of a status dictionary.
pub fn status_get_name(status: &Message) -> Option<&str> {
    status.get_str(KEY_STATUS)
}

/// Reads progress in percent, or [`PERCENT_UNKNOWN`] if the status has none.
///
/// Values above 100 are clamped; negative values read as unknown.
pub fn percent_complete(status: &Message) -> i32 {
    match status.get(KEY_PERCENT) {
        Some(Message::Integer(p)) if *p >= 0 => (*p).min(100) as i32,
        Some(Message::Real(p)) if *p >= 0.0 => p.min(100.0) as i32,
        _ => PERCENT_UNKNOWN,
    }
}

/// Reads total and current item information from a browse status.
pub fn current_list(status: &Message) -> ItemProgress {
    let counter = |key| status.get(key).and_then(Message::as_unsigned).unwrap_or(0);
    ItemProgress {
        total: counter(KEY_TOTAL),
        current_index: counter(KEY_CURRENT_INDEX),
        current_amount: counter(KEY_CURRENT_AMOUNT),
        list: status
            .get(KEY_CURRENT_LIST)
            .and_then(Message::as_array)
            .map(<[Message]>::to_vec),
    }
}

/// Extracts the embedded error, if any.
///
/// Many successful statuses carry no error node; that is `None`, not a failure.
pub fn status_get_error(status: &Message) -> Option<StatusError> {
    let name = status.get_str(KEY_ERROR).map(str::to_string);
    let description = status.get_str(KEY_ERROR_DESCRIPTION).map(str::to_string);
    let code = status
        .get(KEY_ERROR_DETAIL)
        .or_else(|| status.get(KEY_ERROR_CODE))
        .and_then(Message::as_unsigned);

    if name.is_none() && description.is_none() && code.is_none() {
        return None;
    }
    Some(StatusError {
        name,
        description,
        code,
    })
}

/// Builds a status message that reports `error` as terminal failure.
///
/// Used to surface failures that happen after a callback-mode operation
/// has already returned to its caller.
pub fn error_status(error: &StatusError) -> Message {
    let mut dict = Dictionary::new();
    dict.insert(KEY_STATUS.to_string(), Message::from("Error"));
    dict.insert(
        KEY_ERROR.to_string(),
        Message::from(error.name.as_deref().unwrap_or("UnknownError")),
    );
    if let Some(description) = &error.description {
        dict.insert(KEY_ERROR_DESCRIPTION.to_string(), description.as_str().into());
    }
    if let Some(code) = error.code.and_then(|c| i64::try_from(c).ok()) {
        dict.insert(KEY_ERROR_DETAIL.to_string(), Message::Integer(code));
    }
    Message::Dictionary(dict)
}

/// A parsed view over one status message.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    raw: Message,
}

impl StatusMessage {
    /// Wraps a received message; statuses must be dictionaries.
    pub fn new(raw: Message) -> ProtocolResult<Self> {
        if raw.as_dictionary().is_none() {
            return Err(ProtocolError::unexpected_kind("status dictionary", raw.kind()));
        }
        Ok(Self { raw })
    }

    pub fn name(&self) -> Option<&str> {
        status_get_name(&self.raw)
    }

    pub fn percent_complete(&self) -> i32 {
        percent_complete(&self.raw)
    }

    pub fn item_progress(&self) -> ItemProgress {
        current_list(&self.raw)
    }

    pub fn error(&self) -> Option<StatusError> {
        status_get_error(&self.raw)
    }

    pub fn is_complete(&self) -> bool {
        self.name() == Some(STATUS_COMPLETE)
    }

    /// True once no further status is expected for the operation.
    pub fn is_terminal(&self) -> bool {
        self.is_complete() || self.error().is_some()
    }

    pub fn as_message(&self) -> &Message {
        &self.raw
    }

    pub fn into_message(self) -> Message {
        self.raw
    }
}
