//! The measurement loop.
//!
//! Waits for the first broker session, then repeats forever: measure,
//! publish the outcome, sleep `refresh_interval`. Only the cancellation
//! token ends it. A running measurement is abandoned on cancellation, which
//! kills the child process.
//!
//! Outcomes measured while the session is down are logged and dropped
//! rather than queued, so an outage cannot fill the client's request queue
//! ahead of the reconnect announcements.

use std::sync::Arc;

use serde::Serialize;
use speedtest2mqtt_mqtt::ConnectionState;
use tokio::{
    sync::watch,
    time::{sleep, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    measurement::{format_latency, Measurement, MeasurementError, MeasurementResult},
    runner::MeasurementSource,
    session::wait_until_connected,
    topics::{TopicPublisher, Topics},
};

#[derive(Serialize)]
struct ResultAttributes<'a> {
    url_result: &'a str,
    server_id: &'a str,
    timestamp: &'a str,
}

#[derive(Serialize)]
struct ErrorAttributes<'a> {
    message: &'a str,
    level: &'a str,
    timestamp: &'a str,
}

pub struct Scheduler {
    source: Arc<dyn MeasurementSource>,
    publisher: TopicPublisher,
    topics: Topics,
    interval: Duration,
}

impl Scheduler {
    pub fn new(
        source: Arc<dyn MeasurementSource>,
        publisher: TopicPublisher,
        topics: Topics,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            publisher,
            topics,
            interval,
        }
    }

    /// Maps one outcome onto the state topics.
    ///
    /// A success overwrites every measurement topic and clears the error
    /// sensor. A failure only raises the error sensor and its attributes,
    /// leaving the previous measurement retained.
    pub async fn publish_outcome(&self, outcome: &Measurement) {
        match outcome {
            Measurement::Success(result) => self.publish_result(result).await,
            Measurement::Failure(err) => self.publish_error(err).await,
        }
    }

    async fn publish_result(&self, result: &MeasurementResult) {
        let t = &self.topics;
        let p = &self.publisher;

        p.publish_state(&t.ping(), format_latency(result.ping_ms)).await;
        p.publish_state(&t.download(), result.download_mbps.to_string()).await;
        p.publish_state(&t.upload(), result.upload_mbps.to_string()).await;
        p.publish_state(&t.isp(), result.isp.as_str()).await;
        p.publish_state(&t.server(), result.server_name.as_str()).await;

        let attributes = ResultAttributes {
            url_result: &result.result_url,
            server_id: &result.server_id,
            timestamp: &result.timestamp,
        };
        match serde_json::to_string(&attributes) {
            Ok(json) => p.publish_state(&t.attributes(), json).await,
            Err(e) => warn!("Failed to serialize result attributes: {}", e),
        }

        p.publish_state(&t.error(), "off").await;

        debug!("Downstream BW: {} Mbit/s", result.download_mbps);
        debug!("Upstream BW: {} Mbit/s", result.upload_mbps);
        debug!("Ping latency: {} ms", result.ping_ms);
        debug!("ISP: {}, server: {} ({})", result.isp, result.server_name, result.server_id);
        debug!("Result URL: {}", result.result_url);
    }

    async fn publish_error(&self, err: &MeasurementError) {
        self.publisher.publish_state(&self.topics.error(), "on").await;

        let attributes = ErrorAttributes {
            message: &err.message,
            level: &err.level,
            timestamp: &err.timestamp,
        };
        match serde_json::to_string(&attributes) {
            Ok(json) => {
                self.publisher
                    .publish_state(&self.topics.error_attributes(), json)
                    .await
            }
            Err(e) => warn!("Failed to serialize error attributes: {}", e),
        }
    }

    /// Measures once and publishes the outcome.
    pub async fn run_cycle(&self) -> Measurement {
        let outcome = self.measure().await;
        self.publish_outcome(&outcome).await;
        outcome
    }

    async fn measure(&self) -> Measurement {
        let start = Instant::now();
        let outcome = self.source.measure().await;

        match &outcome {
            Measurement::Success(r) => info!(
                "Speedtest finished in {:.1}s: {} / {} Mbit/s, {} ms",
                start.elapsed().as_secs_f64(),
                r.download_mbps,
                r.upload_mbps,
                r.ping_ms
            ),
            Measurement::Failure(e) => error!(
                "Speedtest failed ({}): {}",
                e.level, e.message
            ),
        }

        outcome
    }

    /// Runs until `cancel` fires.
    pub async fn run(
        self,
        mut state_rx: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) {
        if !wait_until_connected(&mut state_rx, &cancel).await {
            info!("Scheduler stopped before the first connection");
            return;
        }

        info!(
            "Measurement loop started (interval: {}s)",
            self.interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.measure() => {
                    let state = state_rx.borrow().clone();
                    if state.is_connected() {
                        self.publish_outcome(&outcome).await;
                    } else {
                        warn!("Broker session is {}, dropping this measurement", state);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }

        info!("Measurement loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::Value;
    use tracing_test::traced_test;

    use super::*;
    use crate::core::{
        measurement::classify,
        topics::testing::RecordingSink,
    };

    /// Replays canned outcomes, then repeats the last one.
    struct FakeSource {
        outcomes: Mutex<Vec<Measurement>>,
        calls: Mutex<usize>,
    }

    impl FakeSource {
        fn new(mut outcomes: Vec<Measurement>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl MeasurementSource for FakeSource {
        async fn measure(&self) -> Measurement {
            *self.calls.lock().unwrap() += 1;
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.len() > 1 {
                outcomes.pop().unwrap()
            } else {
                outcomes[0].clone()
            }
        }
    }

    fn success() -> Measurement {
        Measurement::Success(MeasurementResult {
            download_mbps: 1000,
            upload_mbps: 999,
            ping_ms: 12.0,
            isp: "Example ISP".into(),
            server_name: "Vodafone".into(),
            server_id: "4302".into(),
            timestamp: "2024-05-01T10:00:00Z".into(),
            result_url: "https://www.speedtest.net/result/c/abc".into(),
        })
    }

    fn scheduler(source: Arc<FakeSource>, sink: Arc<RecordingSink>, interval: Duration) -> Scheduler {
        Scheduler::new(
            source,
            TopicPublisher::new(sink),
            Topics::new("speedtest"),
            interval,
        )
    }

    #[tokio::test]
    async fn test_success_publish_order() {
        let sink = Arc::new(RecordingSink::default());
        let source = Arc::new(FakeSource::new(vec![success()]));
        scheduler(source, sink.clone(), Duration::from_secs(1))
            .run_cycle()
            .await;

        assert_eq!(
            sink.topics(),
            vec![
                "speedtest/ping",
                "speedtest/download",
                "speedtest/upload",
                "speedtest/isp",
                "speedtest/server",
                "speedtest/attributes",
                "speedtest/error",
            ]
        );

        let published = sink.published();
        assert!(published.iter().all(|p| p.retain && p.qos == 0));
        assert_eq!(published[0].payload, "12.0");
        assert_eq!(published[1].payload, "1000");
        assert_eq!(published[2].payload, "999");
        assert_eq!(published[6].payload, "off");

        let attributes: Value = serde_json::from_str(&published[5].payload).unwrap();
        assert_eq!(attributes["url_result"], "https://www.speedtest.net/result/c/abc");
        assert_eq!(attributes["server_id"], "4302");
        assert_eq!(attributes["timestamp"], "2024-05-01T10:00:00Z");
    }

    #[tokio::test]
    async fn test_tool_error_publishes_only_error_topics() {
        let stderr = r#"{"type":"log","level":"error","message":"x","timestamp":"t"}"#;
        let sink = Arc::new(RecordingSink::default());
        let source = Arc::new(FakeSource::new(vec![classify("", stderr)]));
        scheduler(source, sink.clone(), Duration::from_secs(1))
            .run_cycle()
            .await;

        let published = sink.published();
        assert_eq!(
            sink.topics(),
            vec!["speedtest/error", "speedtest/error_attributes"]
        );
        assert_eq!(published[0].payload, "on");

        let attributes: Value = serde_json::from_str(&published[1].payload).unwrap();
        assert_eq!(
            attributes,
            serde_json::json!({"message": "x", "level": "error", "timestamp": "t"})
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_waits_for_connection_then_loops() {
        let sink = Arc::new(RecordingSink::default());
        let source = Arc::new(FakeSource::new(vec![
            success(),
            Measurement::Failure(MeasurementError::new("fatal", "spawn failed")),
            success(),
        ]));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            scheduler(source.clone(), sink.clone(), Duration::from_millis(50))
                .run(state_rx, cancel.clone()),
        );

        sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls(), 0);

        state_tx.send(ConnectionState::Connected(1)).unwrap();
        sleep(Duration::from_millis(300)).await;
        assert!(source.calls() >= 3);

        cancel.cancel();
        handle.await.unwrap();

        let errors: Vec<_> = sink
            .published()
            .into_iter()
            .filter(|p| p.topic == "speedtest/error")
            .map(|p| p.payload)
            .collect();
        assert_eq!(&errors[..3], ["off", "on", "off"]);
        assert!(logs_contain("Speedtest failed (fatal): spawn failed"));
        assert!(logs_contain("Measurement loop stopped"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_outage_results_are_not_queued() {
        let sink = Arc::new(RecordingSink::default());
        let source = Arc::new(FakeSource::new(vec![success()]));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected(1));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(
            scheduler(source.clone(), sink.clone(), Duration::from_millis(50))
                .run(state_rx, cancel.clone()),
        );

        sleep(Duration::from_millis(20)).await;
        assert_eq!(sink.published().len(), 7);

        state_tx.send(ConnectionState::Reconnecting(10.0)).unwrap();
        let calls = source.calls();
        sleep(Duration::from_millis(200)).await;
        assert!(source.calls() > calls);
        assert_eq!(sink.published().len(), 7);
        assert!(logs_contain("dropping this measurement"));

        state_tx.send(ConnectionState::Connected(2)).unwrap();
        sleep(Duration::from_millis(200)).await;
        assert!(sink.published().len() > 7);

        cancel.cancel();
        handle.await.unwrap();
    }
}
