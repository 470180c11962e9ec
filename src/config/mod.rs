//! Application configuration.
//!
//! One TOML file with four sections: `[logger]`, `[speedtest]`,
//! `[homeassistant]` and `[transport]`. Every key has a default, so a file
//! holding only the broker address is a valid configuration. The file is
//! loaded once at startup and never changes afterwards.

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use validator::Validate;

use self::{homeassistant::HomeAssistantConfig, logger::LoggerConfig, speedtest::SpeedtestConfig};

pub mod homeassistant;
pub mod logger;
pub mod speedtest;

/// Environment variable pointing at the configuration file.
pub const CONFIG_ENV: &str = "SPEEDTEST2MQTT_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "/etc/speedtest2mqtt/config.toml";

/// Current UTC time for the pre-logger console lines.
#[doc(hidden)]
pub fn timestamp() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Timestamped console lines for use before the tracing subscriber exists.
#[macro_export]
macro_rules! print_info {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("INFO").green(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_warn {
    ($($arg:tt)*) => {
        println!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("WARN").yellow(),
            format_args!($($arg)*)
        );
    };
}

#[macro_export]
macro_rules! print_error {
    ($($arg:tt)*) => {
        eprintln!("{}  {} {}",
            console::style($crate::config::timestamp()).dim(),
            console::style("ERROR").red(),
            format_args!($($arg)*)
        );
    };
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No file given and none at the default location.
    #[error("No configuration file found. Set SPEEDTEST2MQTT_CONFIG or create /etc/speedtest2mqtt/config.toml")]
    NotFound,

    #[error("Configuration file does not exist: {0}")]
    MissingFile(PathBuf),

    #[error("IO error while reading configuration: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error while reading configuration: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[derive(Serialize, Deserialize, Debug, Validate, Clone, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub logger: LoggerConfig,

    #[validate(nested)]
    pub speedtest: SpeedtestConfig,

    #[validate(nested)]
    pub homeassistant: HomeAssistantConfig,

    /// Broker connection.
    #[validate(nested)]
    pub transport: TransportConfig,
}

pub type TransportConfig = speedtest2mqtt_mqtt::Config;

impl Config {
    /// Locates, loads and validates the configuration file.
    ///
    /// # Errors
    ///
    /// Any `ConfigError` from locating, reading, parsing or validating.
    pub fn new() -> Result<Self, ConfigError> {
        let config_path = Self::get_config_path()?;
        Self::load(&config_path)
    }

    /// `SPEEDTEST2MQTT_CONFIG` if set, otherwise the default path when it
    /// exists.
    fn get_config_path() -> Result<PathBuf, ConfigError> {
        if let Ok(config_path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(config_path);
            print_info!("Using config from {}: {}", CONFIG_ENV, path.display());
            return Ok(path);
        }

        let fallback = Path::new(DEFAULT_CONFIG_PATH);
        if fallback.exists() {
            print_info!("Using default config path: {}", fallback.display());
            return Ok(fallback.to_path_buf());
        }

        Err(ConfigError::NotFound)
    }

    /// Loads and validates the configuration at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        print_info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::MissingFile(path.to_path_buf()));
        }

        let config_str = fs::read_to_string(path)?;
        let config = Self::parse(&config_str)?;

        print_info!("Successfully loaded config from: {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration text.
    pub fn parse(config_str: &str) -> Result<Config, ConfigError> {
        let config: Config =
            toml::from_str(config_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(config)
    }
}
