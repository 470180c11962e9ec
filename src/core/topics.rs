//! Topic layout and the best-effort publish primitive.
//!
//! Every state topic lives under the device id:
//!
//! ```text
//! {device_id}/status            online | offline
//! {device_id}/download          integer Mbit/s
//! {device_id}/upload            integer Mbit/s
//! {device_id}/ping              float ms
//! {device_id}/isp               text
//! {device_id}/server            text
//! {device_id}/attributes        {"url_result", "server_id", "timestamp"}
//! {device_id}/error             on | off
//! {device_id}/error_attributes  {"message", "level", "timestamp"}
//! ```

use std::{error::Error, sync::Arc};

use speedtest2mqtt_mqtt::MqttInstance;
use tracing::{debug, warn};

/// How a publish behaves when the broker connection is backed up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Rejected at once when the request queue is full.
    BestEffort,
    /// Waits for room in the request queue.
    Queued,
}

/// Anything that can put a payload on a broker topic.
#[async_trait::async_trait]
pub trait TopicSink: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: u8,
        delivery: Delivery,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;
}

#[async_trait::async_trait]
impl TopicSink for MqttInstance {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
        qos: u8,
        delivery: Delivery,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let sent = match delivery {
            Delivery::BestEffort => self.try_publish(topic, payload, qos, retain),
            Delivery::Queued => MqttInstance::publish(self, topic, payload, qos, retain).await,
        };
        sent.map_err(|e| Box::new(e) as _)
    }
}

/// State topics of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    device_id: String,
}

impl Topics {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
        }
    }

    /// `{device_id}/{leaf}`
    pub fn topic(&self, leaf: &str) -> String {
        format!("{}/{}", self.device_id, leaf)
    }

    pub fn status(&self) -> String {
        self.topic("status")
    }

    pub fn download(&self) -> String {
        self.topic("download")
    }

    pub fn upload(&self) -> String {
        self.topic("upload")
    }

    pub fn ping(&self) -> String {
        self.topic("ping")
    }

    pub fn isp(&self) -> String {
        self.topic("isp")
    }

    pub fn server(&self) -> String {
        self.topic("server")
    }

    pub fn attributes(&self) -> String {
        self.topic("attributes")
    }

    pub fn error(&self) -> String {
        self.topic("error")
    }

    pub fn error_attributes(&self) -> String {
        self.topic("error_attributes")
    }
}

/// Fire-and-forget publishing.
///
/// Failures are logged at `warn` and dropped; there is no retry. A
/// publisher made by [`queued`](Self::queued) waits for queue space instead
/// of failing on a backed-up connection.
#[derive(Clone)]
pub struct TopicPublisher {
    sink: Arc<dyn TopicSink>,
    delivery: Delivery,
}

impl TopicPublisher {
    pub fn new(sink: Arc<dyn TopicSink>) -> Self {
        Self {
            sink,
            delivery: Delivery::BestEffort,
        }
    }

    /// Same sink, but every publish waits for queue space.
    pub fn queued(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            delivery: Delivery::Queued,
        }
    }

    pub async fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, retain: bool, qos: u8) {
        let payload = payload.into();
        let len = payload.len();
        match self.sink.publish(topic, payload, retain, qos, self.delivery).await {
            Ok(()) => debug!("Published {} bytes on {}", len, topic),
            Err(e) => warn!("Publishing to topic {} failed: {}", topic, e),
        }
    }

    /// Retained QoS 0, the mode of every state topic.
    pub async fn publish_state(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.publish(topic, payload, true, 0).await;
    }

    /// Empty, non-retained payload. For discovery config topics this
    /// removes the entity.
    pub async fn retract(&self, topic: &str) {
        match self.sink.publish(topic, Vec::new(), false, 0, self.delivery).await {
            Ok(()) => debug!("Retracted {}", topic),
            Err(e) => warn!("Deleting topic {} failed: {}", topic, e),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// One captured publish.
    #[derive(Debug, Clone, PartialEq)]
    pub struct Published {
        pub topic: String,
        pub payload: String,
        pub retain: bool,
        pub qos: u8,
        pub delivery: Delivery,
    }

    /// In-memory sink recording every publish in order.
    #[derive(Default)]
    pub struct RecordingSink {
        published: Mutex<Vec<Published>>,
        fail: bool,
        saturated: bool,
    }

    impl RecordingSink {
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        /// Behaves like a request queue filled during an outage: best-effort
        /// publishes are rejected, queued ones go through.
        pub fn saturated() -> Self {
            Self {
                saturated: true,
                ..Default::default()
            }
        }

        pub fn published(&self) -> Vec<Published> {
            self.published.lock().unwrap().clone()
        }

        pub fn topics(&self) -> Vec<String> {
            self.published().into_iter().map(|p| p.topic).collect()
        }

        pub fn clear(&self) {
            self.published.lock().unwrap().clear();
        }
    }

    #[async_trait::async_trait]
    impl TopicSink for RecordingSink {
        async fn publish(
            &self,
            topic: &str,
            payload: Vec<u8>,
            retain: bool,
            qos: u8,
            delivery: Delivery,
        ) -> Result<(), Box<dyn Error + Send + Sync>> {
            if self.fail {
                return Err("broker unavailable".into());
            }
            if self.saturated && delivery == Delivery::BestEffort {
                return Err("request queue full".into());
            }
            self.published.lock().unwrap().push(Published {
                topic: topic.to_string(),
                payload: String::from_utf8(payload).unwrap(),
                retain,
                qos,
                delivery,
            });
            Ok(())
        }
    }
}
