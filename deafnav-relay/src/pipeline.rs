/**
 * TELEMETRY PIPELINE - Hot path for every inbound bracelet message
 *
 * FLOW :
 * ingest -> breach rule against the device's previous pulse -> device table
 * -> fire-and-forget pulse write -> telemetry_update push -> alert pushes
 *
 * Malformed input stops at the first step: no alert, no write, no push.
 * The transport loop awaits `handle` per message, so records of one device
 * are evaluated in arrival order.
 */

use crate::alerts::{AlertEngine, AlertInput};
use crate::broadcast::{Broadcaster, PushEvent, TelemetryUpdate};
use crate::ingress::IngressAdapter;
use crate::models::{AlertEvent, TelemetryRecord};
use crate::persistence::{SharedSink, spawn_save};
use crate::state::{Shared, SharedClock, new_state};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};

/// A device counts as connected while its last record is younger than this.
pub const CONNECTED_WINDOW_SECS: i64 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StressLevel {
    Normal,
    Elevated,
}

/// Latest known readings of one bracelet. Absent fields of a new record
/// keep the previous reading.
#[derive(Debug, Clone)]
struct DeviceEntry {
    pulse: Option<i64>,
    distance: Option<f64>,
    battery: Option<u8>,
    last_sync: OffsetDateTime,
}

impl DeviceEntry {
    fn merge(&mut self, rec: &TelemetryRecord) {
        self.pulse = rec.pulse.or(self.pulse);
        self.distance = rec.distance.or(self.distance);
        self.battery = rec.battery.or(self.battery);
        self.last_sync = rec.received_at;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub device_id: String,
    pub pulse: Option<i64>,
    pub distance: Option<f64>,
    pub battery: Option<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_sync: OffsetDateTime,
    pub stress_level: StressLevel,
    pub connected: bool,
}

#[derive(Debug, PartialEq)]
pub enum HandleOutcome {
    /// Topic is not a telemetry topic.
    Ignored,
    /// Malformed payload, dropped.
    Dropped,
    Accepted { alerts: Vec<AlertEvent> },
}

pub struct TelemetryPipeline {
    adapter: IngressAdapter,
    engine: AlertEngine,
    devices: Shared<HashMap<String, DeviceEntry>>,
    sink: SharedSink,
    broadcaster: Arc<Broadcaster>,
    clock: SharedClock,
}

impl TelemetryPipeline {
    pub fn new(
        adapter: IngressAdapter,
        engine: AlertEngine,
        sink: SharedSink,
        broadcaster: Arc<Broadcaster>,
        clock: SharedClock,
    ) -> Self {
        Self {
            adapter,
            engine,
            devices: new_state(HashMap::new()),
            sink,
            broadcaster,
            clock,
        }
    }

    pub fn topics(&self) -> Vec<String> {
        self.adapter.topics()
    }

    pub fn handle(&self, raw: &[u8], topic: &str) -> HandleOutcome {
        let record = match self.adapter.ingest(raw, topic) {
            Ok(Some(record)) => record,
            Ok(None) => return HandleOutcome::Ignored,
            Err(e) => {
                warn!("[telemetry] dropped message on {topic}: {e}");
                return HandleOutcome::Dropped;
            }
        };

        let previous_pulse = {
            let mut devices = self.devices.lock();
            match devices.get_mut(&record.device_id) {
                Some(entry) => {
                    let previous = entry.pulse;
                    entry.merge(&record);
                    previous
                }
                None => {
                    devices.insert(
                        record.device_id.clone(),
                        DeviceEntry {
                            pulse: record.pulse,
                            distance: record.distance,
                            battery: record.battery,
                            last_sync: record.received_at,
                        },
                    );
                    None
                }
            }
        };

        let alerts = self.engine.evaluate(
            AlertInput::Telemetry {
                previous_pulse,
                current: &record,
            },
            self.clock.now(),
        );

        if let Some(pulse) = record.pulse {
            spawn_save(
                self.sink.clone(),
                record.device_id.clone(),
                "pulse",
                pulse.into(),
                record.received_at,
            );
        }

        self.broadcaster
            .emit(PushEvent::TelemetryUpdate(TelemetryUpdate::from(&record)), None);
        for alert in &alerts {
            info!("[alert] {}", alert.message);
            self.broadcaster.emit(PushEvent::Alert(alert.clone()), None);
        }

        HandleOutcome::Accepted { alerts }
    }

    fn status_of(&self, device_id: &str, entry: &DeviceEntry, now: OffsetDateTime) -> DeviceStatus {
        let stress_level = match entry.pulse {
            Some(p) if self.engine.is_above_threshold(p) => StressLevel::Elevated,
            _ => StressLevel::Normal,
        };
        DeviceStatus {
            device_id: device_id.to_string(),
            pulse: entry.pulse,
            distance: entry.distance,
            battery: entry.battery,
            last_sync: entry.last_sync,
            stress_level,
            connected: (now - entry.last_sync).whole_seconds() < CONNECTED_WINDOW_SECS,
        }
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceStatus> {
        let now = self.clock.now();
        let devices = self.devices.lock();
        devices.get(device_id).map(|e| self.status_of(device_id, e, now))
    }

    pub fn devices(&self) -> Vec<DeviceStatus> {
        let now = self.clock.now();
        let devices = self.devices.lock();
        let mut list: Vec<_> = devices.iter().map(|(id, e)| self.status_of(id, e, now)).collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }
}
