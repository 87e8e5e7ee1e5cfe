/**
 * ALERT ENGINE - Edge-triggered rules over telemetry and provider diffs
 *
 * ROLE :
 * Pure functions of (previous state, current state) -> AlertEvents.
 * The engine keeps no state of its own; callers supply the previous side.
 *
 * RULES :
 * - ThresholdBreach : pulse crosses above the stress threshold (prior below or absent)
 * - EquipmentOutage : elevator flag goes working -> broken (resolved on broken -> working)
 * - DelayNotice : route loses all vehicles, or provider flags a delay (resolved on recovery)
 */

use crate::models::{AlertEvent, AlertKind, AlertStatus, Severity, TelemetryRecord};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// What the engine evaluates on each call.
#[derive(Debug)]
pub enum AlertInput<'a> {
    Telemetry {
        /// Last known pulse of the same device, if any.
        previous_pulse: Option<i64>,
        current: &'a TelemetryRecord,
    },
    Elevators(&'a ElevatorDiff),
    Vehicles(&'a VehicleDiff),
}

#[derive(Debug, Clone, Copy)]
pub struct AlertEngine {
    pulse_threshold: i64,
}

impl AlertEngine {
    pub fn new(pulse_threshold: i64) -> Self {
        Self { pulse_threshold }
    }

    pub fn pulse_threshold(&self) -> i64 {
        self.pulse_threshold
    }

    pub fn is_above_threshold(&self, pulse: i64) -> bool {
        pulse > self.pulse_threshold
    }

    pub fn evaluate(&self, input: AlertInput<'_>, now: OffsetDateTime) -> Vec<AlertEvent> {
        match input {
            AlertInput::Telemetry { previous_pulse, current } => {
                self.threshold_breach(previous_pulse, current).into_iter().collect()
            }
            AlertInput::Elevators(diff) => diff
                .transitions
                .iter()
                .map(|t| equipment_alert(t, now))
                .collect(),
            AlertInput::Vehicles(diff) => delay_notice(diff, now).into_iter().collect(),
        }
    }

    fn threshold_breach(&self, previous_pulse: Option<i64>, current: &TelemetryRecord) -> Option<AlertEvent> {
        let pulse = current.pulse?;
        if !self.is_above_threshold(pulse) {
            return None;
        }
        if previous_pulse.is_some_and(|p| self.is_above_threshold(p)) {
            return None;
        }
        Some(AlertEvent {
            kind: AlertKind::ThresholdBreach,
            severity: Severity::High,
            status: AlertStatus::Active,
            subject_id: current.device_id.clone(),
            message: format!(
                "High stress detected on {}: pulse {} bpm above {} bpm",
                current.device_id, pulse, self.pulse_threshold
            ),
            occurred_at: current.received_at,
        })
    }
}

fn equipment_alert(t: &EquipmentTransition, now: OffsetDateTime) -> AlertEvent {
    let (severity, status, message) = if t.working {
        (
            Severity::Low,
            AlertStatus::Resolved,
            format!("{} is back in service.", t.label),
        )
    } else {
        let mut message = format!("{} is out of service.", t.label);
        if let Some(descr) = t.description.as_deref().filter(|d| !d.is_empty()) {
            message.push_str(&format!(" ({descr})"));
        }
        (Severity::High, AlertStatus::Active, message)
    };
    AlertEvent {
        kind: AlertKind::EquipmentOutage,
        severity,
        status,
        subject_id: t.subject_id.clone(),
        message,
        occurred_at: now,
    }
}

fn delay_notice(diff: &VehicleDiff, now: OffsetDateTime) -> Option<AlertEvent> {
    let delayed = diff.is_delayed();
    if delayed == diff.notice_active {
        return None;
    }
    let (severity, status, message) = if delayed {
        let reason = if diff.current.delay_flagged {
            "provider reports a delay".to_string()
        } else {
            "no vehicle currently on the route".to_string()
        };
        (
            Severity::Medium,
            AlertStatus::Active,
            format!("Route {} delayed: {reason}.", diff.route_id),
        )
    } else {
        (
            Severity::Low,
            AlertStatus::Resolved,
            format!("Route {} back on schedule ({} vehicles active).", diff.route_id, diff.current.active),
        )
    };
    Some(AlertEvent {
        kind: AlertKind::DelayNotice,
        severity,
        status,
        subject_id: diff.route_id.clone(),
        message,
        occurred_at: now,
    })
}

// ---------------------------------------------------------------------------
// Elevator payloads and diff

#[derive(Debug, Deserialize)]
struct StationIn {
    station_name: Option<String>,
    #[serde(rename = "accessibilityDescr")]
    accessibility_descr: Option<String>,
    #[serde(rename = "isWorking")]
    is_working: Option<Value>,
    #[serde(default)]
    elevators: Vec<ElevatorIn>,
}

#[derive(Debug, Deserialize)]
struct ElevatorIn {
    name: Option<String>,
    #[serde(rename = "isWorking")]
    is_working: Option<Value>,
}

/// Working flag of one piece of equipment in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct EquipmentFlag {
    pub working: bool,
    pub label: String,
    pub station: Option<String>,
    pub description: Option<String>,
}

/// `isWorking` arrives as 0/1 or as a bool.
fn working_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|v| v != 0),
        Value::String(s) => match s.trim() {
            "1" | "true" => Some(true),
            "0" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Extracts working flags keyed by subject id.
///
/// Accepts a station list (`[{station_name, elevators: [...]}]`), a single
/// station object, or a single equipment object carrying `isWorking`, in
/// which case the resource id is the subject.
pub fn equipment_flags(resource_id: &str, payload: &Value) -> BTreeMap<String, EquipmentFlag> {
    let mut flags = BTreeMap::new();
    match payload {
        Value::Array(items) => {
            for item in items {
                collect_station(resource_id, item, &mut flags);
            }
        }
        Value::Object(_) => collect_station(resource_id, payload, &mut flags),
        _ => {}
    }
    flags
}

fn collect_station(resource_id: &str, item: &Value, flags: &mut BTreeMap<String, EquipmentFlag>) {
    let Ok(station) = StationIn::deserialize(item) else {
        return;
    };
    let station_name = station.station_name.clone().filter(|s| !s.trim().is_empty());

    for elevator in &station.elevators {
        let Some(working) = elevator.is_working.as_ref().and_then(working_flag) else {
            continue;
        };
        let name = elevator.name.clone().unwrap_or_else(|| "elevator".into());
        let station_label = station_name.clone().unwrap_or_else(|| resource_id.to_string());
        flags.insert(
            format!("{station_label}/{name}"),
            EquipmentFlag {
                working,
                label: format!("Elevator \"{name}\" at station {station_label}"),
                station: Some(station_label),
                description: station.accessibility_descr.clone(),
            },
        );
    }

    if let Some(working) = station.is_working.as_ref().and_then(working_flag) {
        let subject = station_name.clone().unwrap_or_else(|| resource_id.to_string());
        flags.insert(
            subject.clone(),
            EquipmentFlag {
                working,
                label: format!("Elevator at {subject}"),
                station: station_name,
                description: station.accessibility_descr,
            },
        );
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EquipmentTransition {
    pub subject_id: String,
    pub label: String,
    pub station: Option<String>,
    pub description: Option<String>,
    /// State after the transition.
    pub working: bool,
}

/// Working-flag changes between two snapshots of the same resource.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ElevatorDiff {
    pub resource_id: String,
    pub transitions: Vec<EquipmentTransition>,
}

impl ElevatorDiff {
    /// Equipment missing from `previous` counts as previously working, so a
    /// first snapshot that already reports a breakdown raises it once.
    pub fn between(resource_id: &str, previous: Option<&Value>, current: &Value) -> Self {
        let before = previous.map(|p| equipment_flags(resource_id, p)).unwrap_or_default();
        let after = equipment_flags(resource_id, current);

        let transitions = after
            .into_iter()
            .filter_map(|(subject_id, flag)| {
                let was_working = before.get(&subject_id).map(|f| f.working).unwrap_or(true);
                (was_working != flag.working).then_some(EquipmentTransition {
                    subject_id,
                    label: flag.label,
                    station: flag.station,
                    description: flag.description,
                    working: flag.working,
                })
            })
            .collect();

        Self {
            resource_id: resource_id.to_string(),
            transitions,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Vehicle payloads and diff

/// Summary of a vehicle-position snapshot for one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VehicleState {
    pub active: usize,
    pub delay_flagged: bool,
}

impl VehicleState {
    /// `null` (what the telematics API returns for an empty route) counts as no vehicles.
    pub fn from_payload(payload: &Value) -> Self {
        let vehicles = vehicle_list(payload);
        let delay_flagged = vehicles.iter().any(|v| {
            v.get("delayed").and_then(Value::as_bool).unwrap_or(false)
                || v.get("delay_minutes").and_then(Value::as_f64).is_some_and(|m| m > 0.0)
        });
        Self {
            active: vehicles.len(),
            delay_flagged,
        }
    }
}

pub fn vehicle_list(payload: &Value) -> &[Value] {
    match payload {
        Value::Array(items) => items.as_slice(),
        _ => &[],
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VehicleDiff {
    pub route_id: String,
    pub previous: Option<VehicleState>,
    pub current: VehicleState,
    /// Whether a DelayNotice for this route is currently active.
    pub notice_active: bool,
}

impl VehicleDiff {
    /// An empty route is only a delay once vehicles had been seen on it, or
    /// while a delay is already standing.
    pub fn is_delayed(&self) -> bool {
        if self.current.delay_flagged {
            return true;
        }
        if self.current.active > 0 {
            return false;
        }
        self.notice_active || self.previous.is_some_and(|p| p.active > 0)
    }
}
