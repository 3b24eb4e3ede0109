//! Core types shared by the tether crates: the [`Message`] model, the
//! [`ClientOptions`] builder and tracing setup.

pub mod message;
pub mod options;
pub mod tracing;

pub use message::{Dictionary, Message, MessageKind};
pub use options::{
    ApplicationType, ArchiveType, ClientOptions, ClientOptionsBuilder, OptionKey, OptionsError,
};
pub use tracing::{init_tracing, TracingConfig, TracingError, TracingOutputFormat};
