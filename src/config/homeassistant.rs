//! `[homeassistant]` section: device identity and discovery toggle.
//!
//! The `device_id` doubles as the root of every state topic, so it must be a
//! valid single MQTT topic level.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct HomeAssistantConfig {
    /// Announce entities on connect when true, retract them when false.
    pub enable_discovery: bool,

    #[validate(custom(function = "validate_topic_level"))]
    pub device_id: String,

    #[validate(length(min = 1, message = "Device name cannot be empty"))]
    pub device_name: String,

    pub manufacturer: String,

    pub model: String,
}

impl Default for HomeAssistantConfig {
    fn default() -> Self {
        HomeAssistantConfig {
            enable_discovery: true,
            device_id: "speedtest".to_string(),
            device_name: "Speedtest".to_string(),
            manufacturer: "Ookla".to_string(),
            model: "Speedtest CLI".to_string(),
        }
    }
}

/// Non-empty, no `/` and no wildcards.
fn validate_topic_level(level: &str) -> Result<(), ValidationError> {
    if level.is_empty() || level.contains(['/', '+', '#']) {
        let mut err = ValidationError::new("invalid_device_id");
        err.message = Some(format!("Device id must be a single topic level: '{}'", level).into());
        return Err(err);
    }
    Ok(())
}
