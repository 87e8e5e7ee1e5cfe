/*!
# DeafNav DevKit - development helpers for the relay and the bracelet

- MQTT mock that records publishes and simulates inbound messages, no broker needed
- Builders for the telemetry payloads bracelets publish
- Test harness with per-topic expectations and JSON field assertions
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{MockMqttClient, TelemetryMessageBuilder};
pub use test_utils::TestHarness;

/// Topics used by bracelets and the relay.
pub mod topics {
    pub const TELEMETRY: &str = "deafnav/telemetry";
    pub const LEGACY_PULSE: &str = "deafnav/pulse";
    pub const RELAY_HEALTH: &str = "deafnav/relay/health";
}
