//! Tracing setup for the controller runtime.
//!
//! Builds a `tracing-subscriber` registry with an [`EnvFilter`] and one fmt
//! layer in the requested [`LogFormat`]. The filter comes from `RUST_LOG` when
//! set, otherwise from [`LoggingConfig::level`].
//!
//! # Example
//! ```no_run
//! use qt3_daq::logging::{self, LogFormat, LoggingConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoggingConfig {
//!     level: "debug".into(),
//!     format: LogFormat::Compact,
//!     ..Default::default()
//! };
//! logging::init(&config)?;
//! tracing::info!(device = "Dev1", "Controllers ready");
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Output format for log events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, colored (for development)
    #[default]
    Pretty,
    /// Single-line, no colors
    Compact,
    /// JSON lines for log aggregation
    Json,
}

/// `logging` section of the lab configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormat,
    /// Emit span open/close events
    pub with_span_events: bool,
    /// Include source file and line
    pub with_file_and_line: bool,
    /// Include thread names (useful with counter worker threads)
    pub with_thread_names: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
        }
    }
}

impl LoggingConfig {
    /// Parsed log level.
    pub fn parsed_level(&self) -> Result<Level, String> {
        parse_log_level(&self.level)
    }
}

/// Install the global subscriber.
///
/// Calling this more than once is not an error; later calls leave the first
/// subscriber in place.
pub fn init(config: &LoggingConfig) -> Result<(), String> {
    let level = config.parsed_level()?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let layer = fmt::layer()
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let layer = match config.format {
        LogFormat::Pretty => layer.pretty().with_filter(env_filter).boxed(),
        LogFormat::Compact => layer.compact().with_ansi(false).with_filter(env_filter).boxed(),
        LogFormat::Json => layer.json().with_filter(env_filter).boxed(),
    };

    // Fails only when a subscriber or `log` bridge is already installed
    if let Err(e) = tracing_subscriber::registry().with(layer).try_init() {
        tracing::debug!(error = %e, "Tracing already initialized");
    }
    Ok(())
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert!(matches!(parse_log_level("trace"), Ok(Level::TRACE)));
        assert!(matches!(parse_log_level("Debug"), Ok(Level::DEBUG)));
        assert!(matches!(parse_log_level("WARN"), Ok(Level::WARN)));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_logging_config_from_yaml() {
        use figment::providers::{Format, Yaml};

        let config: LoggingConfig = figment::Figment::new()
            .merge(Yaml::string("level: debug\nformat: json\n"))
            .extract()
            .unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert!(matches!(config.parsed_level(), Ok(Level::DEBUG)));
        // Unspecified fields keep defaults
        assert!(config.with_thread_names);
    }

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig {
            format: LogFormat::Compact,
            ..Default::default()
        };
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }
}
