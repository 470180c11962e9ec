//! `[speedtest]` section: the measurement tool and its cadence.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct SpeedtestConfig {
    /// Path of the Ookla `speedtest` executable.
    #[validate(length(min = 1, message = "Speedtest binary path cannot be empty"))]
    pub binary_path: String,

    /// Fixed server to measure against. Absent or empty lets the tool pick.
    pub server_id: Option<String>,

    /// Seconds to sleep after each cycle.
    #[validate(range(min = 1, message = "Refresh interval must be at least 1 second"))]
    pub refresh_interval: u64,

    /// Seconds after which a running measurement is killed.
    #[validate(range(min = 1, message = "Timeout must be at least 1 second"))]
    pub timeout: u64,
}

impl SpeedtestConfig {
    /// The configured server id, with empty strings treated as absent.
    pub fn server_id(&self) -> Option<&str> {
        self.server_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for SpeedtestConfig {
    fn default() -> Self {
        SpeedtestConfig {
            binary_path: "/usr/bin/speedtest".to_string(),
            server_id: None,
            refresh_interval: 3600,
            timeout: 300,
        }
    }
}
