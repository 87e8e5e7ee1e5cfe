use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

pub const ELEVATORS_PROVIDER: &str = "elevators";
pub const VEHICLES_PROVIDER: &str = "vehicles";

/// Normalized telemetry sample, one per inbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub device_id: String,
    pub pulse: Option<i64>,
    pub distance: Option<f64>,
    pub battery: Option<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

/// Composite key of a provider resource: (provider id, resource id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderKey {
    pub provider_id: String,
    pub resource_id: String,
}

impl ProviderKey {
    pub fn new(provider_id: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            resource_id: resource_id.into(),
        }
    }
}

impl fmt::Display for ProviderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider_id, self.resource_id)
    }
}

/// Last successfully fetched state of a provider resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSnapshot {
    pub key: ProviderKey,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
}

impl ProviderSnapshot {
    pub fn age(&self, now: OffsetDateTime) -> time::Duration {
        now - self.fetched_at
    }

    pub fn is_fresh(&self, ttl: std::time::Duration, now: OffsetDateTime) -> bool {
        self.age(now) < ttl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    EquipmentOutage,
    ThresholdBreach,
    DelayNotice,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
    Low,
}

/// Whether an alert raises a condition or clears it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

/// Alert derived from a state transition. Emitted once per transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertEvent {
    pub kind: AlertKind,
    pub severity: Severity,
    pub status: AlertStatus,
    pub subject_id: String,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl AlertEvent {
    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }
}
