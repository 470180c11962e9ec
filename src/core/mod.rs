//! Measurement, publishing and session handling.

pub mod discovery;
pub mod error;
pub mod measurement;
pub mod runner;
pub mod scheduler;
pub mod session;
pub mod topics;
