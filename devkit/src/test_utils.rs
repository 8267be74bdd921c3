/*!
Test harness for the blink gateway

Makes publisher tests short:
- Mock session and scripted metrics wired into a `Publisher`
- Expectations on the number of events per topic
- Assertions on payload fields of the last event of a topic
*/

use crate::metrics_stub::ScriptedMetrics;
use crate::session_stub::{MockGatewaySession, PublishedEvent};
use anyhow::Result;
use blink_gateway::session::{event_topic, DeviceRef};
use blink_gateway::{Publisher, PublisherSettings};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

pub const TEST_GATEWAY_TYPE: &str = "gwType";
pub const TEST_GATEWAY_ID: &str = "G1";
pub const TEST_GATEWAY_NAME: &str = "gw-test";

/// Harness around a publisher backed by in-memory stubs
pub struct TestHarness {
    pub session: MockGatewaySession,
    pub metrics: ScriptedMetrics,
    pub settings: PublisherSettings,
    pub gateway_name: String,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    /// Gateway `gwType/G1`, default publisher settings with a 10ms interval
    pub fn new() -> Self {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();

        let settings = PublisherSettings {
            interval: Duration::from_millis(10),
            ..PublisherSettings::default()
        };

        Self {
            session: MockGatewaySession::new(DeviceRef::new(TEST_GATEWAY_TYPE, TEST_GATEWAY_ID)),
            metrics: ScriptedMetrics::new(),
            settings,
            gateway_name: TEST_GATEWAY_NAME.to_string(),
            expectations: Vec::new(),
        }
    }

    pub fn with_settings(mut self, settings: PublisherSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Publisher sharing this harness's session and metrics
    pub fn publisher(&self) -> Publisher<MockGatewaySession, ScriptedMetrics> {
        Publisher::new(
            self.session.clone(),
            self.metrics.clone(),
            self.settings.clone(),
            self.gateway_name.clone(),
        )
    }

    pub fn gateway_topic(&self) -> String {
        event_topic(self.session.gateway(), &self.settings.event_name)
    }

    pub fn device_topic(&self) -> String {
        event_topic(&self.settings.simulated_device, &self.settings.event_name)
    }

    /// Expect exactly `count` events on `topic`
    pub fn expect_events(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for expectation in &self.expectations {
            let actual_count = self.session.find_events_by_topic(&expectation.topic).len();
            if actual_count != expectation.expected_count {
                anyhow::bail!(
                    "Expectation failed for topic '{}': expected {} events, got {}",
                    expectation.topic,
                    expectation.expected_count,
                    actual_count
                );
            }
        }
        Ok(())
    }

    /// Poll until `topic` has at least `count` events
    pub async fn wait_for_events(
        &self,
        topic: &str,
        count: usize,
        timeout_ms: u64,
    ) -> Result<Vec<PublishedEvent>> {
        let start = Instant::now();

        while start.elapsed() < Duration::from_millis(timeout_ms) {
            let events = self.session.find_events_by_topic(topic);
            if events.len() >= count {
                return Ok(events);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        anyhow::bail!("Timeout waiting for {} events on {}", count, topic);
    }

    pub fn assert_field_exists(&self, topic: &str, field_path: &str) -> Result<()> {
        let msg = self.last_message(topic)?;
        if get_nested_field(&msg, field_path).is_none() {
            anyhow::bail!("Field '{}' not found in latest event on {}", field_path, topic);
        }
        Ok(())
    }

    pub fn assert_field_absent(&self, topic: &str, field_path: &str) -> Result<()> {
        let msg = self.last_message(topic)?;
        if let Some(value) = get_nested_field(&msg, field_path) {
            anyhow::bail!("Field '{}' unexpectedly present on {}: {}", field_path, topic, value);
        }
        Ok(())
    }

    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let msg = self.last_message(topic)?;
        match get_nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!(
                "Field '{}' mismatch: expected {:?}, got {:?}",
                field_path,
                expected,
                actual
            ),
            None => anyhow::bail!("Field '{}' not found for comparison in {}", field_path, topic),
        }
    }

    pub fn get_stats(&self) -> TestStats {
        let events = self.session.get_published_events();
        let mut topic_counts = HashMap::new();

        for event in &events {
            *topic_counts.entry(event.topic.clone()).or_insert(0) += 1;
        }

        TestStats {
            total_events: events.len(),
            topic_counts,
            samples_taken: self.metrics.sample_count(),
            disconnects: self.session.disconnect_count(),
        }
    }

    pub fn reset(&mut self) {
        self.session.clear();
        self.expectations.clear();
    }

    fn last_message(&self, topic: &str) -> Result<Value> {
        self.session
            .get_last_json_message::<Value>(topic)?
            .ok_or_else(|| anyhow::anyhow!("No event published on {}", topic))
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in path.split('.') {
        match current {
            Value::Object(obj) => current = obj.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}

#[derive(Debug)]
pub struct TestStats {
    pub total_events: usize,
    pub topic_counts: HashMap<String, usize>,
    pub samples_taken: usize,
    pub disconnects: usize,
}
