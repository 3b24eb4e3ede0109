//! Tracing setup shared by tether binaries and tests.
//!
//! ```ignore
//! use tether_core::tracing::{init_tracing, TracingConfig};
//!
//! init_tracing(TracingConfig::default())?;
//! ```

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    prelude::*,
};

/// Errors that can occur during tracing initialization.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("failed to set global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("failed to parse env filter: {0}")]
    EnvFilter(#[from] tracing_subscriber::filter::ParseError),
}

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TracingOutputFormat {
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event, for log collectors.
    Json,
}

/// Crates whose events are enabled by the default filter.
const TARGETS: [&str; 3] = ["tether_core", "tether_protocol", "tether_client"];

/// Configuration for [`init_tracing`].
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level used for the tether crates when `RUST_LOG` is unset.
    pub default_level: Level,
    /// Log every frame read and written (`tether_protocol` at trace).
    pub trace_frames: bool,
    pub output_format: TracingOutputFormat,
    /// Include file and line of each event.
    pub include_location: bool,
    /// Emit span open/close events, such as the span of a callback-mode operation.
    pub include_span_events: bool,
    /// Explicit filter directive; takes precedence over `RUST_LOG`.
    pub env_filter: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            default_level: Level::INFO,
            trace_frames: false,
            output_format: TracingOutputFormat::Pretty,
            include_location: false,
            include_span_events: false,
            env_filter: None,
        }
    }
}

impl TracingConfig {
    /// Verbose compact output, useful when debugging a device exchange.
    #[must_use]
    pub fn wire_debug() -> Self {
        Self {
            default_level: Level::DEBUG,
            trace_frames: true,
            output_format: TracingOutputFormat::Compact,
            include_location: true,
            include_span_events: true,
            env_filter: None,
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingOutputFormat) -> Self {
        self.output_format = format;
        self
    }

    #[must_use]
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Filter directive used when neither `env_filter` nor `RUST_LOG` is set.
    pub fn default_directive(&self) -> String {
        let level = self.default_level.as_str().to_ascii_lowercase();
        let mut directives: Vec<String> = TARGETS
            .iter()
            .map(|target| format!("{target}={level}"))
            .collect();
        if self.trace_frames {
            directives.retain(|d| !d.starts_with("tether_protocol="));
            directives.push("tether_protocol=trace".to_string());
        }
        directives.join(",")
    }

    fn filter(&self) -> Result<EnvFilter, TracingError> {
        match &self.env_filter {
            Some(directive) => Ok(EnvFilter::try_new(directive)?),
            None => match EnvFilter::try_from_default_env() {
                Ok(filter) => Ok(filter),
                Err(_) => Ok(EnvFilter::try_new(self.default_directive())?),
            },
        }
    }
}

/// Installs the global tracing subscriber.
///
/// # Errors
///
/// Fails if a global subscriber is already installed or the filter
/// directive does not parse.
pub fn init_tracing(config: TracingConfig) -> Result<(), TracingError> {
    let filter = config.filter()?;
    let span_events = if config.include_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(span_events);

    let layer = match config.output_format {
        TracingOutputFormat::Pretty => layer.pretty().boxed(),
        TracingOutputFormat::Compact => layer.compact().boxed(),
        TracingOutputFormat::Json => layer.json().boxed(),
    };

    let subscriber = tracing_subscriber::registry().with(filter).with(layer);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TracingConfig::default();
        assert_eq!(config.default_level, Level::INFO);
        assert_eq!(config.output_format, TracingOutputFormat::Pretty);
        assert!(!config.include_span_events);
        assert!(config.env_filter.is_none());
    }

    #[test]
    fn wire_debug_config() {
        let config = TracingConfig::wire_debug();
        assert_eq!(config.default_level, Level::DEBUG);
        assert!(config.include_span_events);
        assert_eq!(
            config.default_directive(),
            "tether_core=debug,tether_client=debug,tether_protocol=trace"
        );
    }

    #[test]
    fn default_directive_covers_every_crate() {
        let config = TracingConfig::default().with_level(Level::WARN);
        assert_eq!(
            config.default_directive(),
            "tether_core=warn,tether_protocol=warn,tether_client=warn"
        );
        assert!(config.filter().is_ok());
    }

    #[test]
    fn builder_methods() {
        let config = TracingConfig::default()
            .with_level(Level::WARN)
            .with_format(TracingOutputFormat::Json)
            .with_env_filter("tether_client=trace");

        assert_eq!(config.default_level, Level::WARN);
        assert_eq!(config.output_format, TracingOutputFormat::Json);
        assert_eq!(config.env_filter.as_deref(), Some("tether_client=trace"));
    }

    #[test]
    fn invalid_filter_is_reported() {
        let config = TracingConfig::default().with_env_filter("tether=loud");
        assert!(matches!(config.filter(), Err(TracingError::EnvFilter(_))));
    }
}
