//! Home Assistant MQTT discovery.
//!
//! One config document per entity, retained on
//! `homeassistant/{entity_type}/{entity_id}/config`. Home Assistant never
//! removes stale entities by itself, so [`DiscoveryPublisher::retract`]
//! clears exactly the topics [`DiscoveryPublisher::announce`] fills. Both
//! walk the same [`SENSORS`] table.
//!
//! Document for the ping sensor of device `speedtest`:
//!
//! ```json
//! {"name":"Speedtest Ping","availability_topic":"speedtest/status",
//!  "payload_available":"online","payload_not_available":"offline",
//!  "unique_id":"speedtest-speedtest_net_ping",
//!  "device":{"identifiers":["speedtest"],"name":"Speedtest","manufacturer":"Ookla","model":"Speedtest CLI"},
//!  "state_topic":"speedtest/ping","unit_of_measurement":"ms",
//!  "json_attributes_topic":"speedtest/attributes","state_class":"measurement"}
//! ```

use std::{collections::BTreeMap, fmt};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::topics::{TopicPublisher, Topics};
use crate::config::homeassistant::HomeAssistantConfig;

const DISCOVERY_PREFIX: &str = "homeassistant";

/// Identity of the device every entity belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDescriptor {
    pub device_id: String,
    pub device_name: String,
    pub manufacturer: String,
    pub model: String,
}

impl From<&HomeAssistantConfig> for DeviceDescriptor {
    fn from(config: &HomeAssistantConfig) -> Self {
        Self {
            device_id: config.device_id.clone(),
            device_name: config.device_name.clone(),
            manufacturer: config.manufacturer.clone(),
            model: config.model.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityType {
    Sensor,
    BinarySensor,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Sensor => "sensor",
            EntityType::BinarySensor => "binary_sensor",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static description of one entity.
///
/// Topics are given as leaves under the device id (`"ping"` becomes
/// `{device_id}/ping`), so the table does not depend on configuration.
#[derive(Debug, Clone, Copy)]
pub struct SensorDefinition {
    /// Display name, prefixed with the device name in the document.
    pub name: &'static str,
    pub entity_id: &'static str,
    pub entity_type: EntityType,
    pub state_leaf: Option<&'static str>,
    pub command_leaf: Option<&'static str>,
    pub unit_of_measurement: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub entity_category: Option<&'static str>,
    pub icon: Option<&'static str>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub payload_on: Option<&'static str>,
    pub payload_off: Option<&'static str>,
    /// Leaf of a JSON side channel shown as entity attributes.
    pub attributes_leaf: Option<&'static str>,
    /// Additional keys copied verbatim into the document.
    pub extra: &'static [(&'static str, &'static str)],
}

impl SensorDefinition {
    const fn sensor(name: &'static str, entity_id: &'static str, state_leaf: &'static str) -> Self {
        Self {
            name,
            entity_id,
            entity_type: EntityType::Sensor,
            state_leaf: Some(state_leaf),
            command_leaf: None,
            unit_of_measurement: None,
            device_class: None,
            entity_category: None,
            icon: None,
            min: None,
            max: None,
            payload_on: None,
            payload_off: None,
            attributes_leaf: None,
            extra: &[],
        }
    }

    const fn binary_sensor(
        name: &'static str,
        entity_id: &'static str,
        state_leaf: &'static str,
        payload_on: &'static str,
        payload_off: &'static str,
    ) -> Self {
        Self {
            entity_type: EntityType::BinarySensor,
            payload_on: Some(payload_on),
            payload_off: Some(payload_off),
            ..Self::sensor(name, entity_id, state_leaf)
        }
    }

    /// `homeassistant/{entity_type}/{entity_id}/config`
    pub fn config_topic(&self) -> String {
        format!(
            "{}/{}/{}/config",
            DISCOVERY_PREFIX, self.entity_type, self.entity_id
        )
    }
}

const MEASUREMENT: &[(&str, &str)] = &[("state_class", "measurement")];

/// Every entity this device exposes.
pub const SENSORS: [SensorDefinition; 7] = [
    SensorDefinition {
        unit_of_measurement: Some("Mbit/s"),
        extra: MEASUREMENT,
        ..SensorDefinition::sensor("Download", "speedtest_net_download", "download")
    },
    SensorDefinition {
        unit_of_measurement: Some("Mbit/s"),
        extra: MEASUREMENT,
        ..SensorDefinition::sensor("Upload", "speedtest_net_upload", "upload")
    },
    SensorDefinition {
        unit_of_measurement: Some("ms"),
        attributes_leaf: Some("attributes"),
        extra: MEASUREMENT,
        ..SensorDefinition::sensor("Ping", "speedtest_net_ping", "ping")
    },
    SensorDefinition {
        icon: Some("mdi:web"),
        ..SensorDefinition::sensor("ISP", "speedtest_net_isp", "isp")
    },
    SensorDefinition {
        icon: Some("mdi:server-network"),
        ..SensorDefinition::sensor("Server", "speedtest_net_server", "server")
    },
    SensorDefinition {
        device_class: Some("problem"),
        entity_category: Some("diagnostic"),
        attributes_leaf: Some("error_attributes"),
        ..SensorDefinition::binary_sensor("Error", "speedtest_net_error", "error", "on", "off")
    },
    SensorDefinition {
        device_class: Some("connectivity"),
        entity_category: Some("diagnostic"),
        ..SensorDefinition::binary_sensor(
            "Status",
            "speedtest_net_status",
            "status",
            "online",
            "offline",
        )
    },
];

#[derive(Debug, Serialize)]
struct DeviceBlock<'a> {
    identifiers: [&'a str; 1],
    name: &'a str,
    manufacturer: &'a str,
    model: &'a str,
}

/// Wire form of a discovery config. Field order is the serialization order.
#[derive(Debug, Serialize)]
struct DiscoveryDocument<'a> {
    name: String,
    availability_topic: String,
    payload_available: &'static str,
    payload_not_available: &'static str,
    unique_id: String,
    device: DeviceBlock<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_category: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_attributes_topic: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<&'static str, &'static str>,
}

impl<'a> DiscoveryDocument<'a> {
    fn new(device: &'a DeviceDescriptor, def: &SensorDefinition) -> Self {
        let topics = Topics::new(device.device_id.as_str());
        Self {
            name: format!("{} {}", device.device_name, def.name),
            availability_topic: topics.status(),
            payload_available: "online",
            payload_not_available: "offline",
            unique_id: format!("{}-{}", device.device_id, def.entity_id),
            device: DeviceBlock {
                identifiers: [device.device_id.as_str()],
                name: &device.device_name,
                manufacturer: &device.manufacturer,
                model: &device.model,
            },
            state_topic: def.state_leaf.map(|leaf| topics.topic(leaf)),
            command_topic: def.command_leaf.map(|leaf| topics.topic(leaf)),
            unit_of_measurement: def.unit_of_measurement,
            device_class: def.device_class,
            entity_category: def.entity_category,
            icon: def.icon,
            min: def.min,
            max: def.max,
            payload_on: def.payload_on,
            payload_off: def.payload_off,
            json_attributes_topic: def.attributes_leaf.map(|leaf| topics.topic(leaf)),
            extra: def.extra.iter().copied().collect(),
        }
    }
}

/// Serialized discovery document for one entity.
pub fn discovery_payload(
    device: &DeviceDescriptor,
    def: &SensorDefinition,
) -> Result<String, serde_json::Error> {
    serde_json::to_string(&DiscoveryDocument::new(device, def))
}

/// Publishes and removes discovery documents.
#[derive(Clone)]
pub struct DiscoveryPublisher {
    publisher: TopicPublisher,
}

impl DiscoveryPublisher {
    pub fn new(publisher: TopicPublisher) -> Self {
        Self { publisher }
    }

    /// Publishes one retained document per definition.
    pub async fn announce(&self, device: &DeviceDescriptor, definitions: &[SensorDefinition]) {
        info!(
            "Announcing {} entities for device '{}' on {}/<type>/<entity>/config",
            definitions.len(),
            device.device_id,
            DISCOVERY_PREFIX
        );
        for def in definitions {
            let topic = def.config_topic();
            match discovery_payload(device, def) {
                Ok(payload) => {
                    debug!("Sending autodiscover for {}", topic);
                    self.publisher.publish_state(&topic, payload).await;
                }
                Err(e) => warn!("Failed to serialize discovery document for {}: {}", topic, e),
            }
        }
    }

    /// Clears the config topic of every definition.
    pub async fn retract(&self, device: &DeviceDescriptor, definitions: &[SensorDefinition]) {
        info!(
            "Discovery disabled, removing {} entities of device '{}'",
            definitions.len(),
            device.device_id
        );
        for def in definitions {
            self.publisher.retract(&def.config_topic()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc};

    use serde_json::{json, Value};

    use super::*;
    use crate::core::topics::testing::RecordingSink;

    fn device() -> DeviceDescriptor {
        DeviceDescriptor::from(&HomeAssistantConfig::default())
    }

    fn definition(entity_id: &str) -> SensorDefinition {
        *SENSORS.iter().find(|d| d.entity_id == entity_id).unwrap()
    }

    #[test]
    fn test_table_is_consistent() {
        let ids: HashSet<_> = SENSORS.iter().map(|d| d.entity_id).collect();
        assert_eq!(ids.len(), 7);

        let binary: Vec<_> = SENSORS
            .iter()
            .filter(|d| d.entity_type == EntityType::BinarySensor)
            .map(|d| d.entity_id)
            .collect();
        assert_eq!(binary, vec!["speedtest_net_error", "speedtest_net_status"]);
    }

    #[test]
    fn test_config_topic() {
        assert_eq!(
            definition("speedtest_net_download").config_topic(),
            "homeassistant/sensor/speedtest_net_download/config"
        );
        assert_eq!(
            definition("speedtest_net_error").config_topic(),
            "homeassistant/binary_sensor/speedtest_net_error/config"
        );
    }

    #[test]
    fn test_ping_document_is_exact() {
        let payload = discovery_payload(&device(), &definition("speedtest_net_ping")).unwrap();
        assert_eq!(
            payload,
            concat!(
                r#"{"name":"Speedtest Ping","availability_topic":"speedtest/status","#,
                r#""payload_available":"online","payload_not_available":"offline","#,
                r#""unique_id":"speedtest-speedtest_net_ping","#,
                r#""device":{"identifiers":["speedtest"],"name":"Speedtest","manufacturer":"Ookla","model":"Speedtest CLI"},"#,
                r#""state_topic":"speedtest/ping","unit_of_measurement":"ms","#,
                r#""json_attributes_topic":"speedtest/attributes","state_class":"measurement"}"#
            )
        );
    }

    #[test]
    fn test_binary_sensor_document() {
        let payload = discovery_payload(&device(), &definition("speedtest_net_error")).unwrap();
        let doc: Value = serde_json::from_str(&payload).unwrap();

        assert_eq!(doc["state_topic"], "speedtest/error");
        assert_eq!(doc["payload_on"], "on");
        assert_eq!(doc["payload_off"], "off");
        assert_eq!(doc["device_class"], "problem");
        assert_eq!(doc["entity_category"], "diagnostic");
        assert_eq!(doc["json_attributes_topic"], "speedtest/error_attributes");
        assert!(doc.get("unit_of_measurement").is_none());
        assert!(doc.get("command_topic").is_none());
        assert!(doc.get("min").is_none());
    }

    #[test]
    fn test_optional_fields_are_rendered() {
        let def = SensorDefinition {
            command_leaf: Some("set"),
            min: Some(0.0),
            max: Some(100.0),
            ..SensorDefinition::sensor("Limit", "limit", "limit")
        };
        let doc: Value = serde_json::from_str(&discovery_payload(&device(), &def).unwrap()).unwrap();
        assert_eq!(doc["command_topic"], "speedtest/set");
        assert_eq!(doc["min"], json!(0.0));
        assert_eq!(doc["max"], json!(100.0));
    }

    #[tokio::test]
    async fn test_announce_publishes_seven_retained_documents() {
        let sink = Arc::new(RecordingSink::default());
        let discovery = DiscoveryPublisher::new(TopicPublisher::new(sink.clone()));

        discovery.announce(&device(), &SENSORS).await;

        let published = sink.published();
        assert_eq!(published.len(), 7);
        for (p, def) in published.iter().zip(SENSORS.iter()) {
            assert_eq!(p.topic, def.config_topic());
            assert!(p.retain);
            let doc: Value = serde_json::from_str(&p.payload).unwrap();
            assert_eq!(doc["unique_id"], format!("speedtest-{}", def.entity_id));
        }
    }

    #[tokio::test]
    async fn test_retract_clears_the_announced_topics() {
        let sink = Arc::new(RecordingSink::default());
        let discovery = DiscoveryPublisher::new(TopicPublisher::new(sink.clone()));

        discovery.announce(&device(), &SENSORS).await;
        let announced = sink.topics();
        sink.clear();

        discovery.retract(&device(), &SENSORS).await;
        let published = sink.published();
        assert_eq!(sink.topics(), announced);
        assert!(published.iter().all(|p| p.payload.is_empty() && !p.retain));
    }
}
