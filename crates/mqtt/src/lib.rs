//! Broker session layer for speedtest2mqtt.
//!
//! Built on `rumqttc`. A single [`ConnectionKernel`] task owns the event loop
//! and all socket I/O; the rest of the application publishes through a
//! cloneable [`MqttInstance`] and observes [`ConnectionState`] over a watch
//! channel.
//!
//! ## Modules
//!
//! * `backoff` — reconnect delay schedule (fixed by default, optionally
//!   exponential with a cap), never exhausted.
//! * `client` — `rumqttc` client construction: credentials, last will, TLS.
//! * `config` — `[transport]` configuration with `validator` rules.
//! * `connection` — the connection kernel and its reconnect loop.
//! * `error` — [`TransferError`].
//! * `manager` — [`MqttManager`] and the [`MqttInstance`] handle.
//! * `state` — [`ConnectionState`].

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod manager;
pub mod state;

#[cfg(test)]
mod testing;

pub use backoff::Backoff;
pub use config::{Config, TlsConfig};
pub use connection::ConnectionKernel;
pub use error::TransferError;
pub use manager::{MqttInstance, MqttManager};
pub use state::ConnectionState;
