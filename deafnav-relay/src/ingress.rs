/**
 * INGRESS ADAPTER - Normalizes bracelet telemetry arriving over MQTT
 *
 * ROLE :
 * Turns a raw publish (topic + bytes) into a TelemetryRecord.
 * Topics other than the registered ones are ignored, not rejected.
 *
 * PAYLOADS :
 * - telemetry topic : JSON object, `deviceId` required, `pulse`, `distance`, `battery` optional
 * - legacy pulse topic : bare integer (first-generation bracelets), device `default_device`
 *
 * Absent or non-numeric fields stay `None` ("no signal"), never zero.
 */

use crate::error::IngestError;
use crate::models::TelemetryRecord;
use crate::state::SharedClock;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

pub const LEGACY_DEVICE_ID: &str = "default_device";

#[derive(Debug, Deserialize)]
struct TelemetryIn {
    #[serde(rename = "deviceId")]
    device_id: Option<Value>,
    pulse: Option<Value>,
    distance: Option<Value>,
    battery: Option<Value>,
}

pub struct IngressAdapter {
    telemetry_topic: String,
    legacy_pulse_topic: Option<String>,
    clock: SharedClock,
}

impl IngressAdapter {
    pub fn new(telemetry_topic: impl Into<String>, legacy_pulse_topic: Option<String>, clock: SharedClock) -> Self {
        Self {
            telemetry_topic: telemetry_topic.into(),
            legacy_pulse_topic,
            clock,
        }
    }

    /// Topics the transport loop must subscribe to.
    pub fn topics(&self) -> Vec<String> {
        let mut topics = vec![self.telemetry_topic.clone()];
        if let Some(legacy) = &self.legacy_pulse_topic {
            topics.push(legacy.clone());
        }
        topics
    }

    /// `Ok(None)` means the topic is not ours.
    pub fn ingest(&self, raw: &[u8], topic: &str) -> Result<Option<TelemetryRecord>, IngestError> {
        if topic == self.telemetry_topic {
            self.parse_telemetry(raw).map(Some)
        } else if self.legacy_pulse_topic.as_deref() == Some(topic) {
            self.parse_legacy_pulse(raw).map(Some)
        } else {
            Ok(None)
        }
    }

    fn parse_telemetry(&self, raw: &[u8]) -> Result<TelemetryRecord, IngestError> {
        let msg: TelemetryIn = serde_json::from_slice(raw)
            .map_err(|e| IngestError::MalformedPayload(e.to_string()))?;

        let device_id = match msg.device_id {
            Some(Value::String(id)) if !id.trim().is_empty() => id,
            Some(Value::Number(n)) => n.to_string(),
            _ => return Err(IngestError::MalformedPayload("missing deviceId".into())),
        };

        let battery = msg.battery.as_ref().and_then(as_integer).and_then(|b| {
            let level = u8::try_from(b).ok().filter(|l| *l <= 100);
            if level.is_none() {
                debug!("[ingress] battery {b} out of range for {device_id}, treated as absent");
            }
            level
        });

        Ok(TelemetryRecord {
            pulse: msg.pulse.as_ref().and_then(as_integer),
            distance: msg.distance.as_ref().and_then(Value::as_f64),
            battery,
            device_id,
            received_at: self.clock.now(),
        })
    }

    fn parse_legacy_pulse(&self, raw: &[u8]) -> Result<TelemetryRecord, IngestError> {
        let text = std::str::from_utf8(raw).map_err(|e| IngestError::MalformedPayload(e.to_string()))?;
        let pulse = text
            .trim()
            .parse::<i64>()
            .map_err(|_| IngestError::MalformedPayload(format!("legacy pulse is not an integer: {text:?}")))?;
        Ok(TelemetryRecord {
            device_id: LEGACY_DEVICE_ID.to_string(),
            pulse: Some(pulse),
            distance: None,
            battery: None,
            received_at: self.clock.now(),
        })
    }
}

/// Integers and whole-valued floats (`72.0`) both count.
fn as_integer(value: &Value) -> Option<i64> {
    value
        .as_i64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite() && f.fract() == 0.0).map(|f| f as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;
    use std::sync::Arc;

    fn adapter() -> IngressAdapter {
        IngressAdapter::new("deafnav/telemetry", Some("deafnav/pulse".into()), Arc::new(ManualClock::default()))
    }

    #[test]
    fn test_full_payload() {
        let raw = br#"{"deviceId":"BRAC-001","distance":120,"pulse":88,"battery":85}"#;
        let rec = adapter().ingest(raw, "deafnav/telemetry").unwrap().unwrap();
        assert_eq!(rec.device_id, "BRAC-001");
        assert_eq!(rec.pulse, Some(88));
        assert_eq!(rec.distance, Some(120.0));
        assert_eq!(rec.battery, Some(85));
    }

    #[test]
    fn test_absent_fields_stay_absent() {
        let rec = adapter().ingest(br#"{"deviceId":"dev1"}"#, "deafnav/telemetry").unwrap().unwrap();
        assert_eq!(rec.pulse, None);
        assert_eq!(rec.distance, None);
        assert_eq!(rec.battery, None);

        let rec = adapter()
            .ingest(br#"{"deviceId":"dev1","pulse":"fast","battery":140}"#, "deafnav/telemetry")
            .unwrap()
            .unwrap();
        assert_eq!(rec.pulse, None);
        assert_eq!(rec.battery, None);
    }

    #[test]
    fn test_malformed_payloads() {
        let a = adapter();
        assert!(matches!(a.ingest(b"not json", "deafnav/telemetry"), Err(IngestError::MalformedPayload(_))));
        assert!(matches!(a.ingest(br#"{"pulse":90}"#, "deafnav/telemetry"), Err(IngestError::MalformedPayload(_))));
        assert!(matches!(a.ingest(br#"{"deviceId":""}"#, "deafnav/telemetry"), Err(IngestError::MalformedPayload(_))));
        assert!(matches!(a.ingest(b"[1,2]", "deafnav/telemetry"), Err(IngestError::MalformedPayload(_))));
    }

    #[test]
    fn test_foreign_topic_is_ignored() {
        assert!(adapter().ingest(b"garbage", "deafnav/other").unwrap().is_none());
    }

    #[test]
    fn test_legacy_pulse_topic() {
        let a = adapter();
        let rec = a.ingest(b" 131\n", "deafnav/pulse").unwrap().unwrap();
        assert_eq!(rec.device_id, LEGACY_DEVICE_ID);
        assert_eq!(rec.pulse, Some(131));
        assert!(a.ingest(b"high", "deafnav/pulse").is_err());
        assert_eq!(a.topics(), vec!["deafnav/telemetry".to_string(), "deafnav/pulse".to_string()]);
    }

    #[test]
    fn test_float_pulse_accepted_when_whole() {
        let a = adapter();
        let rec = a.ingest(br#"{"deviceId":"d","pulse":72.0}"#, "deafnav/telemetry").unwrap().unwrap();
        assert_eq!(rec.pulse, Some(72));
        let rec = a.ingest(br#"{"deviceId":"d","pulse":72.5}"#, "deafnav/telemetry").unwrap().unwrap();
        assert_eq!(rec.pulse, None);
    }
}
