//! Entry point of the broker session layer.
//!
//! `MqttManager` builds the client (with its last will), spawns the
//! [`ConnectionKernel`] and hands back an [`MqttInstance`]: a cloneable handle
//! that publishes through the kernel and exposes the connection state.
//!
//! ```ignore
//! let instance = MqttManager::from_config(config)?
//!     .with_last_will("speedtest/status", "offline")
//!     .build_and_start()
//!     .await?;
//!
//! instance.publish("speedtest/status", "online", 0, true).await?;
//! instance.try_publish("speedtest/ping", "12.35", 0, true)?;
//! instance.shutdown(Some("speedtest/status")).await?;
//! ```

use std::time::Duration;

use rumqttc::{AsyncClient, QoS};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use validator::Validate;

use super::{
    client::ClientBuilder, config::Config, connection::ConnectionKernel, error::TransferError,
    state::ConnectionState,
};

/// How long `shutdown` waits for the kernel to confirm the DISCONNECT.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the MQTT infrastructure from a configuration.
pub struct MqttManager {
    config: Config,
    last_will: Option<(String, Vec<u8>)>,
    cancel_token: CancellationToken,
}

impl MqttManager {
    /// Creates a manager from a configuration.
    ///
    /// # Errors
    ///
    /// `TransferError::ConfigError` when the configuration fails validation.
    pub fn from_config(config: Config) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self {
            config,
            last_will: None,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Manager with default settings for the given broker.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, TransferError> {
        let config = Config {
            host: host.into(),
            port,
            ..Default::default()
        };
        Self::from_config(config)
    }

    /// Registers a retained QoS 0 last will for the session.
    pub fn with_last_will(mut self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        self.last_will = Some((topic.into(), payload.into()));
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Token that stops the connection kernel when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Builds the client, spawns the connection kernel and returns the
    /// instance handle.
    ///
    /// Connecting happens in the background; watch
    /// [`MqttInstance::state_receiver`] to learn when the session is up.
    ///
    /// # Errors
    ///
    /// Fails when the client cannot be built, for example because the TLS
    /// material is unreadable.
    pub async fn build_and_start(self) -> Result<MqttInstance, TransferError> {
        info!(
            "Building MQTT client for {}:{}",
            self.config.host, self.config.port
        );

        let mut builder = ClientBuilder::from_config(&self.config)?;
        if let Some((topic, payload)) = self.last_will {
            builder = builder.set_last_will(topic, payload);
        }
        let (client, event_loop) = builder.build()?;

        let kernel = ConnectionKernel::new(event_loop, self.config.backoff(), self.cancel_token.clone());
        let state_rx = kernel.subscribe_state();

        tokio::spawn(kernel.run());
        debug!("Connection kernel spawned");

        Ok(MqttInstance {
            client,
            state_rx,
            cancel_token: self.cancel_token,
        })
    }
}

/// Cloneable handle to a running broker session.
#[derive(Clone)]
pub struct MqttInstance {
    client: AsyncClient,
    state_rx: watch::Receiver<ConnectionState>,
    cancel_token: CancellationToken,
}

impl MqttInstance {
    /// Fresh receiver of the connection state.
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// Queues a publish without waiting.
    ///
    /// While the broker is unreachable the kernel does not drain the request
    /// channel, so a long outage fills it; from then on this is rejected
    /// instead of blocking the caller.
    ///
    /// # Errors
    ///
    /// `InvalidMetadata` for an empty topic or a QoS outside 0..=2,
    /// `ClientTransfer` when the request channel is full.
    pub fn try_publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: u8,
        retain: bool,
    ) -> Result<(), TransferError> {
        let qos = to_qos(topic, qos)?;
        let payload = payload.into();
        debug!(
            "Publishing {} bytes to {} (qos={:?}, retain={})",
            payload.len(),
            topic,
            qos,
            retain
        );
        self.client.try_publish(topic, qos, retain, payload)?;
        Ok(())
    }

    /// Queues a publish, waiting for room in the request channel.
    ///
    /// Once the kernel drains the channel again the publish goes out after
    /// whatever was queued before it. Pending until then, so callers that
    /// must stay responsive should race it against a cancellation token.
    ///
    /// # Errors
    ///
    /// `InvalidMetadata` for an empty topic or a QoS outside 0..=2,
    /// `ClientTransfer` when the event loop is gone.
    pub async fn publish(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: u8,
        retain: bool,
    ) -> Result<(), TransferError> {
        let qos = to_qos(topic, qos)?;
        let payload = payload.into();
        debug!(
            "Queueing {} bytes for {} (qos={:?}, retain={})",
            payload.len(),
            topic,
            qos,
            retain
        );
        self.client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    /// Clean shutdown.
    ///
    /// Publishes `offline` (retained) to `status_topic` when given, sends
    /// DISCONNECT so the broker discards the last will, and waits for the
    /// kernel to report `Disconnected`. Without a live session the kernel is
    /// just cancelled. The kernel is cancelled in every case.
    ///
    /// # Errors
    ///
    /// `ShutdownTimeout` when the kernel did not confirm the disconnect in
    /// time.
    pub async fn shutdown(&self, status_topic: Option<&str>) -> Result<(), TransferError> {
        let mut state_rx = self.state_rx.clone();

        if !state_rx.borrow().is_connected() {
            debug!("Not connected, stopping connection kernel");
            self.cancel_token.cancel();
            return Ok(());
        }

        if let Some(topic) = status_topic {
            if let Err(e) = self.try_publish(topic, "offline", 0, true) {
                warn!("Failed to publish offline status: {}", e);
            }
        }
        if let Err(e) = self.client.disconnect().await {
            warn!("Failed to queue DISCONNECT: {}", e);
        }

        let confirmed = tokio::time::timeout(
            SHUTDOWN_TIMEOUT,
            state_rx.wait_for(|s| matches!(s, ConnectionState::Disconnected(_))),
        )
        .await
        .is_ok();

        self.cancel_token.cancel();

        if confirmed {
            info!("MQTT session closed");
            Ok(())
        } else {
            Err(TransferError::ShutdownTimeout(SHUTDOWN_TIMEOUT))
        }
    }
}

fn to_qos(topic: &str, qos: u8) -> Result<QoS, TransferError> {
    if topic.is_empty() {
        return Err(TransferError::InvalidMetadata("Topic must not be empty".into()));
    }

    match qos {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        _ => Err(TransferError::InvalidMetadata("Invalid QoS value".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use tokio::{net::TcpListener, time::timeout};

    use super::*;
    use crate::testing::{accept_session, publish_topic_and_payload, read_packet};

    #[test]
    fn test_manager_creation() {
        let manager = MqttManager::new("localhost", 1883).unwrap();
        assert_eq!(manager.config().host, "localhost");
        assert_eq!(manager.config().port, 1883);
        assert!(!manager.cancel_token().is_cancelled());
    }

    #[test]
    fn test_manager_rejects_invalid_config() {
        let config = Config {
            keep_alive: 0,
            ..Default::default()
        };
        assert!(matches!(
            MqttManager::from_config(config),
            Err(TransferError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_publish_validates_metadata() {
        let instance = MqttManager::new("127.0.0.1", 1)
            .unwrap()
            .build_and_start()
            .await
            .unwrap();

        let err = instance.try_publish("", "x", 0, true).unwrap_err();
        assert!(matches!(err, TransferError::InvalidMetadata(_)));

        let err = instance.publish("a/b", "x", 3, true).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidMetadata(_)));

        // Queued even though the broker is unreachable.
        assert!(instance.try_publish("a/b", "x", 0, true).is_ok());
        assert!(instance.publish("a/b", "x", 0, true).await.is_ok());

        instance.cancel_token().cancel();
    }

    #[tokio::test]
    async fn test_shutdown_without_broker_cancels_kernel() {
        let instance = MqttManager::new("127.0.0.1", 1)
            .unwrap()
            .with_last_will("dev/status", "offline")
            .build_and_start()
            .await
            .unwrap();

        let mut state_rx = instance.state_receiver();
        let _ = instance.shutdown(Some("dev/status")).await;
        assert!(instance.cancel_token().is_cancelled());

        state_rx
            .wait_for(|s| matches!(s, ConnectionState::Disconnected(_)))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiting_publish_outlives_full_request_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = Config {
            host: "127.0.0.1".into(),
            port: listener.local_addr().unwrap().port(),
            request_channel_capacity: 2,
            ..Default::default()
        };
        let instance = MqttManager::from_config(config)
            .unwrap()
            .build_and_start()
            .await
            .unwrap();

        // No CONNACK yet, so nothing drains the queue.
        instance.try_publish("dev/ping", "1", 0, true).unwrap();
        instance.try_publish("dev/ping", "2", 0, true).unwrap();
        assert!(matches!(
            instance.try_publish("dev/ping", "3", 0, true),
            Err(TransferError::ClientTransfer(_))
        ));

        let waiting = {
            let instance = instance.clone();
            tokio::spawn(async move { instance.publish("dev/status", "online", 0, true).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiting.is_finished());

        let mut socket = timeout(Duration::from_secs(5), accept_session(&listener))
            .await
            .unwrap();
        timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let mut seen = Vec::new();
        while seen.len() < 3 {
            let (header, body) = timeout(Duration::from_secs(5), read_packet(&mut socket))
                .await
                .unwrap();
            if header & 0xF0 == 0x30 {
                seen.push(publish_topic_and_payload(&body));
            }
        }
        assert_eq!(
            seen,
            vec![
                ("dev/ping".to_string(), "1".to_string()),
                ("dev/ping".to_string(), "2".to_string()),
                ("dev/status".to_string(), "online".to_string()),
            ]
        );

        instance.cancel_token().cancel();
    }
}
