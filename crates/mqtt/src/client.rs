//! Construction of the `rumqttc` client and event loop.
//!
//! `ClientBuilder` turns a [`Config`] into an `AsyncClient` / `EventLoop`
//! pair. The last will must be registered here, before the first connect
//! attempt: the broker only learns about it from the CONNECT packet.
//!
//! ```ignore
//! let (client, event_loop) = ClientBuilder::from_config(&config)?
//!     .set_last_will("speedtest/status", "offline")
//!     .build()?;
//! ```

use std::{fs, time::Duration};

use rumqttc::{AsyncClient, EventLoop, LastWill, MqttOptions, QoS, TlsConfiguration, Transport};
use tracing::debug;
use validator::Validate;

use super::{
    config::{Config, TlsConfig},
    error::TransferError,
};

/// Builder for an MQTT client.
///
/// The returned `AsyncClient` is a cheap, cloneable handle; the `EventLoop`
/// performs all socket I/O and must be driven by exactly one task.
pub struct ClientBuilder {
    opts: MqttOptions,
    cap: usize,
    tls_config: Option<TlsConfig>,
}

impl ClientBuilder {
    /// Creates a builder from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `TransferError::ConfigError` when the configuration does not
    /// pass validation.
    pub fn from_config(config: &Config) -> Result<Self, TransferError> {
        config.validate()?;

        let client_id = if config.client_id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            config.client_id.clone()
        };

        let mut opts = MqttOptions::new(client_id, config.host.clone(), config.port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive));
        opts.set_clean_session(config.clean_session);
        opts.set_inflight(config.max_inflight);

        if let Some(max_packet_size) = config.max_packet_size {
            opts.set_max_packet_size(max_packet_size as usize, max_packet_size as usize);
        }

        if let Some((username, password)) = config.credentials() {
            opts.set_credentials(username, password);
        }

        let tls_config = config.tls.clone().filter(TlsConfig::is_enabled);

        Ok(Self {
            opts,
            cap: config.request_channel_capacity as usize,
            tls_config,
        })
    }

    /// Registers the last will: `payload` is published retained at QoS 0 on
    /// `topic` if the connection drops without a DISCONNECT.
    pub fn set_last_will(mut self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        let topic = topic.into();
        debug!("Registering last will on {}", topic);
        let last_will = LastWill::new(topic, payload.into(), QoS::AtMostOnce, true);
        self.opts.set_last_will(last_will);
        self
    }

    fn build_tls_transport(tls_config: &TlsConfig) -> Result<Transport, TransferError> {
        tls_config
            .validate_config()
            .map_err(|e| TransferError::ClientSetup(format!("Invalid TLS configuration: {e}")))?;

        let ca_path = tls_config
            .ca_cert_path
            .as_deref()
            .ok_or_else(|| TransferError::ClientSetup("TLS configuration is not set".into()))?;
        let ca = fs::read(ca_path)?;
        debug!(
            "Using TLS with CA {} (client auth: {})",
            ca_path,
            tls_config.has_client_auth()
        );

        let client_auth = match (&tls_config.client_cert_path, &tls_config.client_key_path) {
            (Some(cert), Some(key)) => Some((fs::read(cert)?, fs::read(key)?)),
            _ => None,
        };

        Ok(Transport::Tls(TlsConfiguration::Simple {
            ca,
            client_auth,
            alpn: None,
        }))
    }

    /// Consumes the builder and returns the client handle and its event loop.
    ///
    /// # Errors
    ///
    /// Fails when TLS is configured and the certificate material cannot be
    /// read.
    pub fn build(self) -> Result<(AsyncClient, EventLoop), TransferError> {
        let mut opts = self.opts;
        let transport = match &self.tls_config {
            Some(tls) => Self::build_tls_transport(tls)?,
            None => Transport::Tcp,
        };
        opts.set_transport(transport);

        Ok(AsyncClient::new(opts, self.cap))
    }
}
