/*!
Broker-less MQTT client for development

Mirrors the publish/subscribe surface of `rumqttc::AsyncClient`, keeps every
publish for later assertions, and can feed simulated inbound messages to a
receiver the code under test drains.
*/

use anyhow::Result;
use chrono::{DateTime, Utc};
use rumqttc::QoS;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub at: DateTime<Utc>,
}

impl MockMessage {
    fn new(topic: String, payload: Vec<u8>, qos: QoS, retain: bool) -> Self {
        Self {
            topic,
            payload,
            qos,
            retain,
            at: Utc::now(),
        }
    }

    pub fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

#[derive(Clone, Default)]
pub struct MockMqttClient {
    published: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<MockMessage>>>>,
}

// a panicking test thread must not take the whole mock down with it
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver for messages injected with [`MockMqttClient::simulate_incoming`].
    pub fn setup_receiver(&self) -> mpsc::UnboundedReceiver<MockMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.inbound) = Some(tx);
        rx
    }

    pub async fn publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        self.try_publish(topic, qos, retain, payload)
    }

    /// Same as `AsyncClient::try_publish`: never waits.
    pub fn try_publish<S, V>(&self, topic: S, qos: QoS, retain: bool, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let msg = MockMessage::new(topic.into(), payload.into(), qos, retain);
        log::debug!("[mock] publish {} ({} bytes)", msg.topic, msg.payload.len());
        lock(&self.published).push(msg);
        Ok(())
    }

    pub async fn subscribe<S: Into<String>>(&self, topic: S, _qos: QoS) -> Result<()> {
        let topic = topic.into();
        log::debug!("[mock] subscribe {topic}");
        lock(&self.subscriptions).push(topic);
        Ok(())
    }

    /// Delivers a message to the receiver from `setup_receiver`, if any.
    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let msg = MockMessage::new(topic.into(), payload.into(), QoS::AtLeastOnce, false);
        log::debug!("[mock] inbound {}", msg.topic);
        if let Some(tx) = lock(&self.inbound).as_ref() {
            tx.send(msg).map_err(|e| anyhow::anyhow!("inbound receiver dropped: {e}"))?;
        }
        Ok(())
    }

    pub fn published(&self) -> Vec<MockMessage> {
        lock(&self.published).clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        lock(&self.subscriptions).clone()
    }

    pub fn messages_on(&self, topic: &str) -> Vec<MockMessage> {
        lock(&self.published)
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    pub fn last_json<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.messages_on(topic).last() {
            Some(msg) => Ok(Some(serde_json::from_slice(&msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        lock(&self.published).clear();
        lock(&self.subscriptions).clear();
    }
}

/// Payloads in the shape bracelets publish.
pub struct TelemetryMessageBuilder;

impl TelemetryMessageBuilder {
    /// `deafnav/telemetry` message; `None` fields are left out.
    pub fn telemetry(device_id: &str, distance: Option<f64>, pulse: Option<i64>, battery: Option<u8>) -> Value {
        let mut msg = serde_json::Map::new();
        msg.insert("deviceId".into(), device_id.into());
        if let Some(d) = distance {
            msg.insert("distance".into(), d.into());
        }
        if let Some(p) = pulse {
            msg.insert("pulse".into(), p.into());
        }
        if let Some(b) = battery {
            msg.insert("battery".into(), b.into());
        }
        Value::Object(msg)
    }

    /// First-generation bracelets publish the bare pulse on `deafnav/pulse`.
    pub fn legacy_pulse(pulse: i64) -> Vec<u8> {
        pulse.to_string().into_bytes()
    }
}
