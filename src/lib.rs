//! speedtest2mqtt: runs the Ookla speedtest CLI on a fixed interval and
//! publishes the results to an MQTT broker, with Home Assistant discovery.
//!
//! ## Modules
//!
//! * `config` — TOML configuration with `validator` rules and defaults.
//!
//! * `core` — the application:
//!   - `runner` / `measurement`: invoking the tool and classifying its output
//!   - `topics`: topic layout and best-effort publishing
//!   - `discovery`: Home Assistant discovery documents
//!   - `session`: status and discovery on every broker session
//!   - `scheduler`: the measure / publish / sleep loop
//!
//! * `logger` — `tracing` subscriber setup: console, journald and a rolling
//!   log file.
//!
//! The broker connection itself lives in the `speedtest2mqtt-mqtt` crate.

pub mod config;
pub mod core;
pub mod logger;
