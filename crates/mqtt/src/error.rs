//! Error type for the broker session layer.
//!
//! Connection failures never surface here during normal operation: the
//! connection kernel retries them internally. `TransferError` covers the
//! things a caller can actually observe: a rejected configuration, a TLS
//! setup problem, or a publish that could not be queued.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// QoS outside 0..=2 or an empty topic.
    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    /// Client could not be constructed from the configuration
    /// (for example unreadable TLS material).
    #[error("Client setup error: {0}")]
    ClientSetup(String),

    /// Configuration rejected by validation.
    #[error("Configuration error: {0}")]
    ConfigError(#[from] validator::ValidationErrors),

    /// The request could not be handed to the event loop, usually because
    /// the connection kernel has already stopped.
    #[error("Client transfer error: {0}")]
    ClientTransfer(#[from] rumqttc::ClientError),

    /// Network-level failure reported by the event loop.
    ///
    /// Boxed to keep the enum small.
    #[error("Client connection error: {0}")]
    ClientConnection(#[from] Box<rumqttc::ConnectionError>),

    /// The kernel did not confirm the disconnect in time.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rumqttc::ConnectionError> for TransferError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        TransferError::ClientConnection(Box::new(err))
    }
}
