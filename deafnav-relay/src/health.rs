use crate::http::AppState;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const HEALTH_PUBLISH_INTERVAL: Duration = Duration::from_secs(30);

/// Outlet for health reports. Must not wait: while the broker is away the
/// client queue fills up, and a report that does not fit is simply skipped.
pub trait HealthOutlet: Send + Sync + 'static {
    fn try_send(&self, topic: &str, payload: Vec<u8>) -> Result<(), String>;
}

impl HealthOutlet for AsyncClient {
    fn try_send(&self, topic: &str, payload: Vec<u8>) -> Result<(), String> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttStatus {
    Connecting,
    Connected,
    Disconnected,
}

#[derive(Debug, Serialize)]
pub struct RelayHealth {
    pub uptime_seconds: u64,
    pub mqtt_status: MqttStatus,
    pub mqtt_reconnects: u32,
    pub subscribers: usize,
    pub snapshots_cached: usize,
    pub devices_tracked: usize,
    pub active_alerts: usize,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<MqttStatus>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new(MqttStatus::Connecting)),
        }
    }

    /// A ConnAck after a lost connection counts as a reconnect.
    pub fn mark_mqtt_connected(&self) {
        let mut status = self.mqtt_status.lock();
        if *status == MqttStatus::Disconnected {
            self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        }
        *status = MqttStatus::Connected;
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = MqttStatus::Disconnected;
    }

    pub fn mqtt_status(&self) -> MqttStatus {
        *self.mqtt_status.lock()
    }

    pub fn mqtt_reconnects(&self) -> u32 {
        self.mqtt_reconnects.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, state: &AppState) -> RelayHealth {
        RelayHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects(),
            subscribers: state.broadcaster.subscriber_count(),
            snapshots_cached: state.aggregator.cache().len(),
            devices_tracked: state.pipeline.device_count(),
            active_alerts: state.board.len(),
        }
    }

    /// Sends one report. Returns whether it was handed to the outlet.
    pub fn publish_health(&self, outlet: &impl HealthOutlet, topic: &str, state: &AppState) -> bool {
        let health = self.get_health(state);
        let payload = match serde_json::to_vec(&health) {
            Ok(p) => p,
            Err(e) => {
                warn!("[health] cannot encode health: {e}");
                return false;
            }
        };
        match outlet.try_send(topic, payload) {
            Ok(()) => {
                debug!(
                    "[health] published (uptime: {}s, devices: {})",
                    health.uptime_seconds, health.devices_tracked
                );
                true
            }
            Err(e) => {
                warn!("[health] report skipped: {e}");
                false
            }
        }
    }

    /// Publishes relay health on `topic` every 30 s through the shared client.
    pub fn spawn_health_publisher<O: HealthOutlet>(
        &self,
        outlet: O,
        topic: String,
        state: AppState,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let tracker = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(HEALTH_PUBLISH_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {}
                }
                tracker.publish_health(&outlet, &topic, &state);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ManualClock, app_state};
    use deafnav_devkit::{MockMqttClient, TestHarness, topics};
    use rumqttc::MqttOptions;
    use serde_json::json;

    impl HealthOutlet for MockMqttClient {
        fn try_send(&self, topic: &str, payload: Vec<u8>) -> Result<(), String> {
            self.try_publish(topic, QoS::AtMostOnce, false, payload)
                .map_err(|e| e.to_string())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_every_interval_until_shutdown() {
        let mut harness = TestHarness::new();
        harness.expect_messages(topics::RELAY_HEALTH, 3);
        let state = app_state(std::sync::Arc::new(ManualClock::default()));
        let shutdown = CancellationToken::new();

        let handle = state.health_tracker.spawn_health_publisher(
            harness.mqtt_client.clone(),
            topics::RELAY_HEALTH.to_string(),
            state.clone(),
            shutdown.clone(),
        );
        // ticks at 0, 30 and 60 s
        tokio::time::sleep(Duration::from_secs(75)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();

        harness.verify_expectations().unwrap();
        harness
            .assert_field_equals(topics::RELAY_HEALTH, "mqtt_status", &json!("connecting"))
            .unwrap();
        harness
            .assert_field_equals(topics::RELAY_HEALTH, "active_alerts", &json!(0))
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_client_does_not_block_shutdown() {
        // nothing polls the event loop, as while the broker is down
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("health-test", "localhost", 1883), 1);
        let state = app_state(std::sync::Arc::new(ManualClock::default()));
        assert!(state.health_tracker.publish_health(&client, topics::RELAY_HEALTH, &state));
        assert!(!state.health_tracker.publish_health(&client, topics::RELAY_HEALTH, &state));

        let shutdown = CancellationToken::new();
        let handle = state.health_tracker.spawn_health_publisher(
            client,
            topics::RELAY_HEALTH.to_string(),
            state.clone(),
            shutdown.clone(),
        );
        tokio::time::sleep(HEALTH_PUBLISH_INTERVAL * 4).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[test]
    fn test_reconnect_counting() {
        let h = HealthTracker::new();
        assert_eq!(h.mqtt_status(), MqttStatus::Connecting);
        h.mark_mqtt_connected();
        assert_eq!(h.mqtt_reconnects(), 0);

        h.mark_mqtt_disconnected();
        h.mark_mqtt_disconnected();
        h.mark_mqtt_connected();
        assert_eq!(h.mqtt_status(), MqttStatus::Connected);
        assert_eq!(h.mqtt_reconnects(), 1);
    }

    #[test]
    fn test_status_wire_format() {
        assert_eq!(serde_json::to_value(MqttStatus::Disconnected).unwrap(), "disconnected");
    }
}
