/*!
Test harness for code that talks MQTT

Wraps a [`MockMqttClient`] with helpers to inject bracelet telemetry,
per-topic count expectations and JSON field assertions.
*/

use crate::mqtt_stub::{MockMqttClient, TelemetryMessageBuilder};
use crate::topics;
use anyhow::Result;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    expectations: Vec<Expectation>,
}

#[derive(Debug)]
struct Expectation {
    topic: String,
    expected_count: usize,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok();
        Self {
            mqtt_client: MockMqttClient::new(),
            expectations: Vec::new(),
        }
    }

    /// Expect exactly `count` publishes on `topic` by the time of
    /// [`TestHarness::verify_expectations`].
    pub fn expect_messages(&mut self, topic: &str, count: usize) -> &mut Self {
        self.expectations.push(Expectation {
            topic: topic.to_string(),
            expected_count: count,
        });
        self
    }

    pub async fn send_telemetry(
        &self,
        device_id: &str,
        distance: Option<f64>,
        pulse: Option<i64>,
        battery: Option<u8>,
    ) -> Result<()> {
        let payload = TelemetryMessageBuilder::telemetry(device_id, distance, pulse, battery);
        self.mqtt_client
            .simulate_incoming(topics::TELEMETRY, serde_json::to_vec(&payload)?)
            .await?;
        log::info!("[harness] telemetry sent for {device_id}");
        Ok(())
    }

    pub async fn send_legacy_pulse(&self, pulse: i64) -> Result<()> {
        self.mqtt_client
            .simulate_incoming(topics::LEGACY_PULSE, TelemetryMessageBuilder::legacy_pulse(pulse))
            .await
    }

    /// Sends raw bytes, e.g. a malformed payload.
    pub async fn send_raw(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.mqtt_client.simulate_incoming(topic, payload.to_vec()).await
    }

    /// Polls for a JSON publish on `topic` until `timeout_ms` runs out.
    pub async fn wait_for_message(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if let Some(msg) = self.mqtt_client.last_json::<Value>(topic)? {
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        log::warn!("[harness] timeout waiting for {topic}");
        Ok(None)
    }

    pub fn verify_expectations(&self) -> Result<()> {
        for exp in &self.expectations {
            let actual = self.mqtt_client.messages_on(&exp.topic).len();
            if actual != exp.expected_count {
                anyhow::bail!(
                    "topic '{}': expected {} messages, got {}",
                    exp.topic,
                    exp.expected_count,
                    actual
                );
            }
        }
        Ok(())
    }

    pub fn assert_message_sent(&self, topic: &str, expected: &Value) -> Result<()> {
        for msg in self.mqtt_client.messages_on(topic) {
            if msg.json()? == *expected {
                return Ok(());
            }
        }
        anyhow::bail!("expected message not found on {topic}")
    }

    /// `field_path` is dot separated, e.g. `metrics.pulse`.
    pub fn assert_field_equals(&self, topic: &str, field_path: &str, expected: &Value) -> Result<()> {
        let Some(msg) = self.mqtt_client.last_json::<Value>(topic)? else {
            anyhow::bail!("no message on {topic}");
        };
        match nested_field(&msg, field_path) {
            Some(actual) if actual == expected => Ok(()),
            Some(actual) => anyhow::bail!("field '{field_path}': expected {expected}, got {actual}"),
            None => anyhow::bail!("field '{field_path}' missing in last message on {topic}"),
        }
    }

    pub fn stats(&self) -> TestStats {
        let published = self.mqtt_client.published();
        let mut topic_counts = HashMap::new();
        for msg in &published {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_messages: published.len(),
            topic_counts,
            subscriptions: self.mqtt_client.subscriptions(),
        }
    }

    pub fn reset(&mut self) {
        self.mqtt_client.clear();
        self.expectations.clear();
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| current.as_object()?.get(part))
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
    pub subscriptions: Vec<String>,
}
