//! Client configuration.
//!
//! Settings live in `~/.config/tether/config.toml` by default:
//!
//! ```toml
//! io_timeout_secs = 30
//! status_timeout_secs = 600
//! wire_format = "binary"
//! label = "tether"
//! backup_protocol_version = "1.6"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_protocol::{MAX_FRAME_SIZE, WireFormat};

use crate::error::{ClientError, ClientResult};

/// Configuration shared by every session a client opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Timeout for connecting and for single request/response exchanges.
    pub io_timeout_secs: u64,

    /// Timeout between two status messages of a long-running operation.
    /// Unset waits indefinitely; installs can take minutes.
    pub status_timeout_secs: Option<u64>,

    /// Largest frame accepted or sent.
    pub max_frame_size: u32,

    /// Payload encoding on the wire.
    pub wire_format: WireFormat,

    /// Label sent to lockdown when starting services.
    pub label: Option<String>,

    /// Backup protocol version requested by default.
    pub backup_protocol_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            io_timeout_secs: 30,
            status_timeout_secs: None,
            max_frame_size: MAX_FRAME_SIZE,
            wire_format: WireFormat::Xml,
            label: None,
            backup_protocol_version: "1.6".to_string(),
        }
    }
}

impl ClientConfig {
    /// Loads the config from the default path, falling back to defaults if
    /// the file does not exist.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads the config from an explicit path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::invalid_argument(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| ClientError::invalid_argument(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Returns `~/.config/tether/config.toml` (or the platform equivalent).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("tether")
            .join("config.toml")
    }

    fn validate(&self) -> ClientResult<()> {
        if self.max_frame_size == 0 {
            return Err(ClientError::invalid_argument("max_frame_size must be positive"));
        }
        if self.io_timeout_secs == 0 {
            return Err(ClientError::invalid_argument("io_timeout_secs must be positive"));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn status_timeout(&self) -> Option<Duration> {
        self.status_timeout_secs.map(Duration::from_secs)
    }

    /// Builder: set the request/response timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// Builder: set the per-status timeout of long-running operations.
    pub fn with_status_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.status_timeout_secs = timeout.map(|t| t.as_secs().max(1));
        self
    }

    /// Builder: set the wire format.
    pub fn with_wire_format(mut self, format: WireFormat) -> Self {
        self.wire_format = format;
        self
    }

    /// Builder: set the maximum frame size. Zero is raised to one byte.
    pub fn with_max_frame_size(mut self, max: u32) -> Self {
        self.max_frame_size = max.max(1);
        self
    }

    /// Builder: set the lockdown label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}
