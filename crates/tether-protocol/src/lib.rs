//! Wire layer for talking to device services.
//!
//! # Protocol Overview
//!
//! Messages are sent as length-prefixed payloads:
//! - 4 bytes: payload length (u32, big-endian)
//! - N bytes: the encoded [`Message`](tether_core::Message), XML or binary
//!   plist by default
//!
//! On top of the framing this crate provides the status-message view used
//! by long-running operations and the DeviceLink envelope used by the
//! backup service.
//!
//! # Example
//!
//! ```rust
//! use tether_core::Message;
//! use tether_protocol::{WireFormat, decode_frame, encode_frame};
//!
//! let request = Message::from_pairs([("Command", "Browse")]);
//! let bytes = encode_frame(WireFormat::Xml, &request).unwrap();
//! let decoded = decode_frame(WireFormat::Xml, &bytes).unwrap();
//! assert_eq!(decoded, request);
//! ```

mod codec;
mod devicelink;
mod error;
mod framing;
mod status;

pub use codec::{WireFormat, from_plist, to_plist};
pub use devicelink::{
    DL_DEVICE_READY, DL_DISCONNECT, DL_PROCESS_MESSAGE, DL_VERSION_EXCHANGE, DL_VERSIONS_OK,
    DeviceLinkMessage, EMPTY_PARAMETER,
};
pub use error::{ProtocolError, ProtocolResult};
pub use framing::{FrameReader, FrameWriter, MessageStream, decode_frame, encode_frame};
pub use status::{
    ItemProgress, PERCENT_UNKNOWN, STATUS_COMPLETE, StatusError, StatusMessage, command_get_name,
    current_list, error_status, percent_complete, status_get_error, status_get_name,
};

/// Maximum frame payload size (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
