//! Logging utilities for latch
//!
//! Console logging only; the engine is a library and never owns a log file.
//! `RUST_LOG` overrides the configured level when present.

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include file/line info
    #[serde(default)]
    pub file_info: bool,

    /// Include module target
    #[serde(default = "default_true")]
    pub show_target: bool,

    /// Use ANSI colors
    #[serde(default = "default_true")]
    pub ansi_colors: bool,

    /// Log level as string
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_true() -> bool {
    true
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            timestamps: true,
            file_info: false,
            show_target: true,
            ansi_colors: true,
            level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Create a debug configuration with verbose output
    pub fn debug() -> Self {
        Self {
            level: "debug".to_string(),
            file_info: true,
            ..Default::default()
        }
    }

    /// Set log level
    pub fn with_level(mut self, level: &str) -> Self {
        self.level = level.to_string();
        self
    }

    /// Parse level string to tracing Level
    pub fn get_level(&self) -> Level {
        match self.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    }
}

/// Initialize logging with the given configuration
///
/// Can be called multiple times; only the first call installs the subscriber.
pub fn init_logging(config: &LogConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_ansi(config.ansi_colors)
        .with_target(config.show_target)
        .with_file(config.file_info)
        .with_line_number(config.file_info)
        .with_writer(std::io::stderr);

    let result = if config.timestamps {
        builder.try_init()
    } else {
        builder.without_time().try_init()
    };

    let _ = result;
}

/// Initialize logging with default settings
pub fn init_default_logging() {
    init_logging(&LogConfig::default());
}

/// Initialize debug logging
pub fn init_debug_logging() {
    init_logging(&LogConfig::debug());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert!(config.timestamps);
        assert!(!config.file_info);
        assert!(config.show_target);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_log_config_debug() {
        let config = LogConfig::debug();
        assert_eq!(config.level, "debug");
        assert!(config.file_info);
    }

    #[test]
    fn test_get_level() {
        assert_eq!(LogConfig::default().get_level(), Level::INFO);
        assert_eq!(LogConfig::debug().get_level(), Level::DEBUG);
        assert_eq!(
            LogConfig::default().with_level("trace").get_level(),
            Level::TRACE
        );
        assert_eq!(
            LogConfig::default().with_level("unknown").get_level(),
            Level::INFO
        );
    }

    #[test]
    fn test_config_serialization() {
        let config = LogConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: LogConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.timestamps, config.timestamps);
        assert_eq!(parsed.level, config.level);
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let parsed: LogConfig = serde_json::from_str("{}").unwrap();
        assert!(parsed.timestamps);
        assert_eq!(parsed.level, "info");
    }
}
