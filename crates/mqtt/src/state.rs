//! Broker session state.
//!
//! The connection kernel is the only writer; everything else observes the
//! state through a `watch` channel. The lifecycle is:
//!
//! ```text
//! Disconnected -> Connecting -> Connected(1) -> Reconnecting(d) -> ... -> Connected(2)
//!                     ^   |
//!                     +---+  (startup failures keep retrying in Connecting)
//! ```
//!
//! There is no terminal state while the process runs. `Disconnected` is only
//! seen before the kernel starts and after a clean shutdown.

use std::fmt;

/// Current state of the broker session.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not connected and not trying to. Carries the reason.
    Disconnected(String),

    /// Establishing the first connection of this process.
    ///
    /// Failed attempts are retried with the configured delay without leaving
    /// this state.
    Connecting,

    /// CONNACK received.
    ///
    /// The counter increases by one for every successful (re)connect, so
    /// observers can tell two consecutive sessions apart even when the watch
    /// channel coalesced the `Reconnecting` state in between.
    Connected(u64),

    /// The session was lost after having been established. The field holds
    /// the seconds until the next attempt.
    Reconnecting(f64),
}

impl ConnectionState {
    /// Short static name of the state, for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected(_) => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected(_) => "Connected",
            ConnectionState::Reconnecting(_) => "Reconnecting",
        }
    }

    /// Contextual details: the disconnect reason, the session number or the
    /// retry delay.
    pub fn details(&self) -> String {
        match self {
            ConnectionState::Disconnected(reason) => reason.clone(),
            ConnectionState::Connecting => String::new(),
            ConnectionState::Connected(session) => format!("session {session}"),
            ConnectionState::Reconnecting(seconds) => format!("in {seconds} seconds"),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting(_)
        )
    }

    /// Session number when connected.
    pub fn session(&self) -> Option<u64> {
        match self {
            ConnectionState::Connected(session) => Some(*session),
            _ => None,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected("not started".into())
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())?;
        let details = self.details();
        if !details.is_empty() {
            write!(f, " ({details})")?;
        }
        Ok(())
    }
}
