//! Broker connection configuration.
//!
//! Deserialized from the `[transport]` table of the application config and
//! validated with the `validator` crate, so a bad port or keep-alive fails at
//! load time rather than at connect time.
//!
//! ```toml
//! [transport]
//! host = "192.168.1.10"
//! port = 1883
//! keep_alive = 60
//! username = "speedtest"
//! password = "secret"
//! reconnect_delay = 10
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use super::backoff::Backoff;

/// MQTT connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_credentials"))]
pub struct Config {
    /// Broker hostname or IP address.
    #[validate(length(
        min = 1,
        max = 255,
        message = "Host must be between 1 and 255 characters"
    ))]
    pub host: String,

    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,

    /// Keep-alive interval in seconds.
    #[validate(range(
        min = 5,
        max = 3600,
        message = "Keep alive must be between 5 and 3600 seconds"
    ))]
    pub keep_alive: u64,

    /// Client identifier. Empty means a random UUID is generated at build time.
    #[validate(length(max = 36, message = "Client ID must not exceed 36 characters"))]
    pub client_id: String,

    /// Broker username. Must be set together with `password`.
    pub username: Option<String>,

    pub password: Option<String>,

    pub clean_session: bool,

    /// Maximum number of unacknowledged QoS 1/2 publishes.
    #[validate(range(
        min = 1,
        max = 1000,
        message = "Max inflight must be between 1 and 1000"
    ))]
    pub max_inflight: u16,

    /// Number of requests the client handle can queue before `publish` waits
    /// for the event loop.
    #[validate(range(
        min = 1,
        max = 255,
        message = "Request channel capacity must be between 1 and 255"
    ))]
    pub request_channel_capacity: u8,

    /// Maximum MQTT packet size in bytes, both directions.
    #[validate(range(
        min = 64,
        max = 65535,
        message = "Max packet size must be between 64 and 65535 bytes"
    ))]
    pub max_packet_size: Option<u16>,

    /// Seconds to wait before the first retry after a failed connect.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Reconnect delay must be between 1 and 3600 seconds"
    ))]
    pub reconnect_delay: u64,

    /// Upper bound of the retry delay in seconds.
    #[validate(range(
        min = 1,
        max = 3600,
        message = "Reconnect max delay must be between 1 and 3600 seconds"
    ))]
    pub reconnect_max_delay: u64,

    /// Growth factor of the retry delay. `1.0` keeps the delay fixed.
    #[validate(range(
        min = 1.0,
        max = 10.0,
        message = "Reconnect multiplier must be between 1.0 and 10.0"
    ))]
    pub reconnect_multiplier: f64,

    /// Optional TLS settings. Absent means plain TCP.
    #[validate(nested)]
    pub tls: Option<TlsConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            host: "localhost".to_string(),
            port: 1883,
            keep_alive: 60,
            client_id: "Speedtest".to_string(),
            username: None,
            password: None,
            clean_session: true,
            max_inflight: 10,
            request_channel_capacity: 32,
            max_packet_size: None,
            reconnect_delay: 10,
            reconnect_max_delay: 10,
            reconnect_multiplier: 1.0,
            tls: None,
        }
    }
}

impl Config {
    /// Reconnect schedule described by this configuration.
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_secs(self.reconnect_delay),
            Duration::from_secs(self.reconnect_max_delay),
            self.reconnect_multiplier,
        )
    }

    /// Credentials when both halves are present.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }
}

fn validate_credentials(config: &Config) -> Result<(), ValidationError> {
    if config.username.is_some() != config.password.is_some() {
        return Err(ValidationError::new("incomplete_credentials")
            .with_message("Both username and password must be provided or neither".into()));
    }
    Ok(())
}

/// TLS settings. CA-only verification or mutual TLS with a client
/// certificate and key (PEM files).
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TlsConfig {
    #[validate(custom(
        function = "validate_file_path",
        message = "CA certificate file does not exist"
    ))]
    pub ca_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Client certificate file does not exist"
    ))]
    pub client_cert_path: Option<String>,

    #[validate(custom(
        function = "validate_file_path",
        message = "Client key file does not exist"
    ))]
    pub client_key_path: Option<String>,
}

impl TlsConfig {
    pub fn with_ca_only(ca_cert_path: impl Into<String>) -> Self {
        TlsConfig {
            ca_cert_path: Some(ca_cert_path.into()),
            client_cert_path: None,
            client_key_path: None,
        }
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_path.is_some() && self.client_key_path.is_some()
    }

    /// TLS is on as soon as a CA certificate is configured.
    pub fn is_enabled(&self) -> bool {
        self.ca_cert_path.is_some()
    }

    /// Checks the combination of paths: a CA is required and client
    /// authentication needs both the certificate and the key.
    pub fn validate_config(&self) -> Result<(), ValidationError> {
        let Some(ca) = &self.ca_cert_path else {
            return Err(ValidationError::new("missing_ca_cert")
                .with_message("CA certificate path is required".into()));
        };
        validate_file_path(ca)?;

        match (&self.client_cert_path, &self.client_key_path) {
            (Some(cert), Some(key)) => {
                validate_file_path(cert)?;
                validate_file_path(key)?;
            }
            (None, None) => {}
            _ => {
                return Err(ValidationError::new("incomplete_client_auth").with_message(
                    "Both client certificate and key must be provided or neither".into(),
                ));
            }
        }

        Ok(())
    }
}

/// Path must be non-empty and point at an existing regular file.
fn validate_file_path(path: &str) -> Result<(), ValidationError> {
    if path.is_empty() {
        return Err(
            ValidationError::new("empty_path").with_message("File path cannot be empty".into())
        );
    }

    let path_obj = Path::new(path);
    if !path_obj.is_file() {
        return Err(ValidationError::new("file_not_found")
            .with_message(format!("File does not exist: {path}").into()));
    }

    Ok(())
}
