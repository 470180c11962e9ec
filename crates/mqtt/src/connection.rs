//! Connection kernel: the single owner of broker I/O.
//!
//! The kernel exclusively drives the `rumqttc` event loop. Every other part
//! of the application holds a cloned `AsyncClient`, which is only a sender
//! into the event loop's request channel, so publishes from several tasks
//! are serialized here without any shared mutable state.
//!
//! ```text
//! Scheduler ----\
//!                AsyncClient (request channel) --> ConnectionKernel --> EventLoop --> TCP/TLS
//! SessionMgr ---/                                        |
//!                                                        +--> watch<ConnectionState>
//! ```
//!
//! Reconnection is an iterative loop: a failed poll sleeps for the next
//! backoff delay and polls again, which makes `rumqttc` dial a new
//! connection. The loop never gives up; the only exits are the cancellation
//! token and a client-initiated DISCONNECT.

use std::time::Duration;

use rumqttc::{ConnectReturnCode, ConnectionError, Event, EventLoop, Outgoing, Packet};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{backoff::Backoff, state::ConnectionState};

/// Drives the event loop, tracks the session state and reconnects.
pub struct ConnectionKernel {
    event_loop: EventLoop,
    backoff: Backoff,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    state_rx: watch::Receiver<ConnectionState>,
    /// Number of successful CONNACKs so far.
    sessions: u64,
}

impl ConnectionKernel {
    pub fn new(event_loop: EventLoop, backoff: Backoff, cancel: CancellationToken) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());
        Self {
            event_loop,
            backoff,
            cancel,
            state_tx,
            state_rx,
            sessions: 0,
        }
    }

    /// Receiver for state changes. It sees the current state immediately.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Broadcasts `state` if it differs from the current one.
    fn update_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state.clone();
                true
            }
        });
        if changed {
            info!("Connection state changed to: {}", state);
        }
    }

    /// Runs until cancelled or until the client sends DISCONNECT.
    ///
    /// Before the first CONNACK every failure is logged as a warning and the
    /// state stays `Connecting`. After it, a failure moves the state to
    /// `Reconnecting(delay)` until the next CONNACK.
    pub async fn run(mut self) {
        self.update_state(ConnectionState::Connecting);
        self.backoff.reset();

        info!("Starting connection event loop...");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("Shutdown signal received, stopping connection kernel");
                    self.update_state(ConnectionState::Disconnected("cancelled".into()));
                    return;
                }

                event_result = self.event_loop.poll() => {
                    match event_result {
                        Ok(event) => {
                            if self.handle_event(event) {
                                info!("Client disconnected cleanly");
                                self.update_state(ConnectionState::Disconnected("client disconnect".into()));
                                return;
                            }
                        }
                        Err(ConnectionError::RequestsDone) => {
                            info!("All client handles dropped, stopping connection kernel");
                            self.update_state(ConnectionState::Disconnected("client dropped".into()));
                            return;
                        }
                        Err(e) => {
                            let delay = self.backoff.next_sleep();
                            self.report_failure(&e, delay);

                            tokio::select! {
                                _ = self.cancel.cancelled() => {
                                    info!("Shutdown signal received while waiting to reconnect");
                                    self.update_state(ConnectionState::Disconnected("cancelled".into()));
                                    return;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                    }
                }
            }
        }
    }

    /// Logs a failed poll and moves to the matching retry state.
    fn report_failure(&self, err: &ConnectionError, delay: Duration) {
        let reason = get_error_message(err);
        let never_connected = self.sessions == 0;

        if is_fatal_error(err) {
            error!(
                "Broker rejected the connection ({}); this usually needs a configuration change. Retrying in {:.0} seconds",
                reason,
                delay.as_secs_f64()
            );
        } else if never_connected {
            warn!(
                "Can't connect to MQTT broker ({}). Retrying in {:.0} seconds.",
                reason,
                delay.as_secs_f64()
            );
        } else {
            warn!(
                "Unexpected disconnection from MQTT ({}), reconnecting in {:.0} seconds",
                reason,
                delay.as_secs_f64()
            );
        }
        debug!("Connection error detail: {:?}", err);

        if never_connected {
            self.update_state(ConnectionState::Connecting);
        } else {
            self.update_state(ConnectionState::Reconnecting(delay.as_secs_f64()));
        }
    }

    /// Processes one event. Returns `true` when the client sent DISCONNECT.
    fn handle_event(&mut self, event: Event) -> bool {
        match event {
            Event::Incoming(Packet::ConnAck(conn_ack)) => {
                if conn_ack.code == ConnectReturnCode::Success {
                    self.sessions += 1;
                    self.backoff.reset();
                    if self.sessions == 1 {
                        info!("Successfully connected to MQTT broker");
                    } else {
                        info!("Successfully reconnected to the MQTT broker");
                    }
                    self.update_state(ConnectionState::Connected(self.sessions));
                }
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Disconnected by broker");
            }
            Event::Incoming(packet) => {
                trace!("Incoming packet: {:?}", packet);
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                return true;
            }
            Event::Outgoing(outgoing) => {
                trace!("Outgoing packet: {:?}", outgoing);
            }
        }
        false
    }
}

/// Whether retrying an error is unlikely to help without operator action.
///
/// The kernel retries these anyway; the classification only decides how
/// loudly the failure is logged.
fn is_fatal_error(err: &ConnectionError) -> bool {
    match err {
        ConnectionError::Tls(_) => true,
        ConnectionError::ConnectionRefused(code) => matches!(
            code,
            ConnectReturnCode::RefusedProtocolVersion
                | ConnectReturnCode::BadClientId
                | ConnectReturnCode::BadUserNamePassword
                | ConnectReturnCode::NotAuthorized
        ),
        ConnectionError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::PermissionDenied | std::io::ErrorKind::InvalidInput
        ),
        _ => false,
    }
}

/// Innermost message of an error chain, without surrounding quotes.
fn get_error_message(e: &dyn std::error::Error) -> String {
    let mut current = e;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string().trim_matches('"').to_string()
}
