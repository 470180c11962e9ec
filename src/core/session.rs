//! Reaction to broker sessions.
//!
//! The connection kernel owns the connection itself. This module reacts to
//! every new session it reports: `online` goes to the status topic, and the
//! discovery set is announced, or retracted when discovery is disabled. It
//! reacts to the session counter, not to state edges, so a reconnect
//! triggers exactly one round even if the intermediate `Reconnecting` state
//! was coalesced away by the watch channel.
//!
//! These publishes wait for room in the request queue. After a long outage
//! the queue may still hold stale scheduler output when the session comes
//! back; waiting lets `online` and the discovery set go out right behind it
//! instead of being rejected.

use speedtest2mqtt_mqtt::ConnectionState;
use tokio::{
    sync::watch,
    time::{sleep, Duration},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    discovery::{DeviceDescriptor, DiscoveryPublisher, SENSORS},
    topics::{TopicPublisher, Topics},
};

const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub struct SessionManager {
    publisher: TopicPublisher,
    discovery: DiscoveryPublisher,
    device: DeviceDescriptor,
    topics: Topics,
    enable_discovery: bool,
}

impl SessionManager {
    pub fn new(publisher: TopicPublisher, device: DeviceDescriptor, enable_discovery: bool) -> Self {
        let publisher = publisher.queued();
        Self {
            discovery: DiscoveryPublisher::new(publisher.clone()),
            topics: Topics::new(device.device_id.as_str()),
            publisher,
            device,
            enable_discovery,
        }
    }

    /// Liveness and discovery for a fresh session.
    pub async fn on_connected(&self) {
        self.publisher.publish_state(&self.topics.status(), "online").await;

        if self.enable_discovery {
            self.discovery.announce(&self.device, &SENSORS).await;
        } else {
            self.discovery.retract(&self.device, &SENSORS).await;
        }
    }

    /// Follows the connection state until cancelled or until the kernel is
    /// gone, running [`on_connected`](Self::on_connected) once per session.
    pub async fn run(
        self,
        mut state_rx: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) {
        let mut handled: Option<u64> = None;

        loop {
            let state = state_rx.borrow_and_update().clone();
            match state.session() {
                Some(session) if handled != Some(session) => {
                    if session > 1 {
                        info!("Session {} established, republishing status and discovery", session);
                    } else {
                        debug!("First session established");
                    }
                    handled = Some(session);
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!("Session manager stopped while announcing");
                            return;
                        }
                        _ = self.on_connected() => {}
                    }
                }
                Some(_) => {}
                None => debug!("Session state: {}", state),
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Session manager stopped");
                    return;
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        debug!("Connection kernel gone, session manager stopping");
                        return;
                    }
                }
            }
        }
    }
}

/// Blocks until the first session is up. Returns `false` when cancelled or
/// when the connection kernel has exited.
pub async fn wait_until_connected(
    state_rx: &mut watch::Receiver<ConnectionState>,
    cancel: &CancellationToken,
) -> bool {
    if state_rx.borrow().is_connected() {
        return true;
    }

    warn!(
        "Waiting for the MQTT broker... Current: {}",
        *state_rx.borrow()
    );
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return false;
                }
                let state = state_rx.borrow_and_update().clone();
                if state.is_connected() {
                    info!("Connected to the MQTT broker");
                    return true;
                }
                debug!("Still not connected: {}", state);
            }
            _ = sleep(WAIT_LOG_INTERVAL) => {
                warn!("Still waiting for the MQTT broker... Current: {}", *state_rx.borrow());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tracing_test::traced_test;

    use super::*;
    use crate::{config::homeassistant::HomeAssistantConfig, core::topics::testing::RecordingSink};

    fn manager(sink: Arc<RecordingSink>, enable_discovery: bool) -> SessionManager {
        SessionManager::new(
            TopicPublisher::new(sink),
            DeviceDescriptor::from(&HomeAssistantConfig::default()),
            enable_discovery,
        )
    }

    async fn settle() {
        sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_connect_publishes_online_then_announces() {
        let sink = Arc::new(RecordingSink::default());
        manager(sink.clone(), true).on_connected().await;

        let published = sink.published();
        assert_eq!(published.len(), 8);
        assert_eq!(published[0].topic, "speedtest/status");
        assert_eq!(published[0].payload, "online");
        assert!(published[0].retain);
        assert!(published[1..]
            .iter()
            .all(|p| p.topic.starts_with("homeassistant/") && p.retain && !p.payload.is_empty()));
    }

    #[tokio::test]
    async fn test_reconnect_reaction_survives_backed_up_queue() {
        let sink = Arc::new(RecordingSink::saturated());
        let publisher = TopicPublisher::new(sink.clone());

        // Scheduler output from the outage is rejected by the full queue.
        for _ in 0..5 {
            publisher.publish_state("speedtest/ping", "12.3").await;
        }
        assert!(sink.published().is_empty());

        SessionManager::new(publisher, DeviceDescriptor::from(&HomeAssistantConfig::default()), true)
            .on_connected()
            .await;

        let published = sink.published();
        assert_eq!(published.len(), 8);
        assert_eq!(published[0].topic, "speedtest/status");
        assert_eq!(published[0].payload, "online");
        assert_eq!(
            published[1..]
                .iter()
                .filter(|p| p.topic.ends_with("/config") && !p.payload.is_empty())
                .count(),
            7
        );
    }

    #[tokio::test]
    async fn test_disabled_discovery_retracts() {
        let sink = Arc::new(RecordingSink::default());
        manager(sink.clone(), false).on_connected().await;

        let published = sink.published();
        assert_eq!(published.len(), 8);
        assert_eq!(published[0].payload, "online");
        assert!(published[1..].iter().all(|p| p.payload.is_empty() && !p.retain));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reannounces_once_per_reconnect() {
        let sink = Arc::new(RecordingSink::default());
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(manager(sink.clone(), true).run(state_rx, cancel.clone()));

        settle().await;
        assert!(sink.published().is_empty());

        state_tx.send(ConnectionState::Connected(1)).unwrap();
        settle().await;
        assert_eq!(sink.published().len(), 8);

        // Reconnecting and Connected(2) sent back to back may be coalesced.
        state_tx.send(ConnectionState::Reconnecting(10.0)).unwrap();
        state_tx.send(ConnectionState::Connected(2)).unwrap();
        settle().await;
        assert_eq!(sink.published().len(), 16);
        assert!(logs_contain("Session 2 established"));

        // A repeated notification of the same session is ignored.
        state_tx.send_replace(ConnectionState::Connected(2));
        settle().await;
        assert_eq!(sink.published().len(), 16);

        let status: Vec<_> = sink
            .published()
            .into_iter()
            .filter(|p| p.topic == "speedtest/status")
            .collect();
        assert_eq!(status.len(), 2);
        assert!(status.iter().all(|p| p.payload == "online"));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_connected() {
        let (state_tx, mut state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();

        let waiter = tokio::spawn(async move {
            let connected = wait_until_connected(&mut state_rx, &cancel).await;
            (connected, state_rx)
        });

        settle().await;
        assert!(!waiter.is_finished());

        state_tx.send(ConnectionState::Connected(1)).unwrap();
        let (connected, _rx) = waiter.await.unwrap();
        assert!(connected);
    }

    #[tokio::test]
    async fn test_wait_until_connected_cancelled() {
        let (_state_tx, mut state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!wait_until_connected(&mut state_rx, &cancel).await);
    }
}
