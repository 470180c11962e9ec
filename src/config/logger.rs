//! `[logger]` section: level and output sinks.
//!
//! ```toml
//! [logger]
//! level = "info"
//! debug = false
//!
//! [logger.console]
//! enabled = true
//! format = "compact"
//!
//! [logger.file]
//! enabled = false
//! directory = "/var/log/speedtest2mqtt"
//! ```

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Console output format.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggerConfig {
    /// trace, debug, info, warn or error (case-insensitive).
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Forces the `debug` level regardless of `level`.
    pub debug: bool,

    #[validate(nested)]
    pub console: Option<ConsoleConfig>,

    #[validate(nested)]
    pub journald: Option<JournaldConfig>,

    #[validate(nested)]
    pub file: Option<FileConfig>,
}

impl LoggerConfig {
    /// Level actually applied to every sink.
    pub fn effective_level(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.level
        }
    }

    pub fn console_enabled(&self) -> bool {
        self.console.as_ref().is_some_and(|c| c.enabled)
    }

    pub fn file_enabled(&self) -> bool {
        self.file.as_ref().is_some_and(|f| f.enabled)
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    match level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = ValidationError::new("invalid_log_level");
            err.message = Some(format!("Invalid log level: {}", level).into());
            Err(err)
        }
    }
}

impl Default for LoggerConfig {
    fn default() -> Self {
        LoggerConfig {
            level: "info".to_string(),
            debug: false,
            console: Some(ConsoleConfig::default()),
            journald: Some(JournaldConfig::default()),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ConsoleConfig {
    pub enabled: bool,

    pub format: LogFormat,

    /// Include the module path of each event.
    pub show_target: bool,

    pub show_thread_ids: bool,

    /// Log span close events.
    pub show_spans: bool,

    pub ansi_colors: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        ConsoleConfig {
            enabled: true,
            format: LogFormat::default(),
            show_target: false,
            show_thread_ids: false,
            show_spans: false,
            ansi_colors: true,
        }
    }
}

/// systemd journald output.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct JournaldConfig {
    #[serde(default)]
    pub enabled: bool,

    #[validate(length(min = 1))]
    pub identifier: String,
}

impl Default for JournaldConfig {
    fn default() -> Self {
        JournaldConfig {
            enabled: false,
            identifier: "speedtest2mqtt".to_string(),
        }
    }
}

/// Rolling log file, rotated daily.
///
/// Used for hosts without journald, or as a replacement for the console
/// when the process runs detached.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct FileConfig {
    pub enabled: bool,

    #[validate(length(min = 1, message = "Log directory cannot be empty"))]
    pub directory: String,

    #[validate(length(min = 1, message = "Log file name prefix cannot be empty"))]
    pub file_name_prefix: String,

    /// Rotated files kept on disk.
    #[validate(range(min = 1, max = 365, message = "Max log files must be between 1 and 365"))]
    pub max_log_files: usize,
}

impl Default for FileConfig {
    fn default() -> Self {
        FileConfig {
            enabled: false,
            directory: "/var/log/speedtest2mqtt".to_string(),
            file_name_prefix: "speedtest2mqtt.log".to_string(),
            max_log_files: 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        let config = LoggerConfig {
            level: "verbose".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = LoggerConfig {
            level: "WARN".into(),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_debug_toggle_overrides_level() {
        let config = LoggerConfig {
            level: "error".into(),
            debug: true,
            ..Default::default()
        };
        assert_eq!(config.effective_level(), "debug");
    }

    #[test]
    fn test_file_sink_validation() {
        let config = LoggerConfig {
            file: Some(FileConfig {
                enabled: true,
                max_log_files: 0,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(config.file_enabled());
    }

    #[test]
    fn test_format_names() {
        let console: ConsoleConfig = toml::from_str(r#"format = "json""#).unwrap();
        assert_eq!(console.format, LogFormat::Json);
    }
}
