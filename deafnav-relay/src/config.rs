use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct RelayConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub polling: PollingConf,
    pub alerts: AlertsConf,
    pub providers: ProvidersConf,
    pub persistence: PersistenceConf,
    pub push: PushConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub telemetry_topic: String,
    /// Older bracelets publish a bare pulse integer on this topic.
    pub legacy_pulse_topic: Option<String>,
    pub health_topic: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PollingConf {
    pub interval_secs: u64,
    pub cache_ttl_secs: u64,
    pub fetch_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AlertsConf {
    /// Stress threshold in beats per minute.
    pub pulse_threshold: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProvidersConf {
    pub elevators: ProviderConf,
    pub vehicles: ProviderConf,
    pub focus: Option<FocusStation>,
}

/// One polled provider. `url` contains a `{resource}` placeholder.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ProviderConf {
    pub url: Option<String>,
    pub resources: Vec<String>,
}

/// Station featured in `arrival_update` pushes.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FocusStation {
    pub line_id: String,
    pub station: String,
    pub line: String,
    pub direction: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConf {
    pub pulse_log: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PushConf {
    /// Per-subscriber queue length; events beyond it are dropped for that subscriber.
    pub subscriber_buffer: usize,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "deafnav-relay".into(),
            keep_alive_secs: 15,
            telemetry_topic: "deafnav/telemetry".into(),
            legacy_pulse_topic: Some("deafnav/pulse".into()),
            health_topic: "deafnav/relay/health".into(),
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl Default for PollingConf {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            cache_ttl_secs: 60,
            fetch_timeout_secs: 10,
            shutdown_grace_secs: 5,
        }
    }
}

impl Default for AlertsConf {
    fn default() -> Self {
        Self { pulse_threshold: 120 }
    }
}

impl Default for ProvidersConf {
    fn default() -> Self {
        Self {
            elevators: ProviderConf {
                url: Some("https://stasy-elevators.georgetomzaridis.eu/api/status/{resource}".into()),
                resources: vec!["1".into(), "2".into(), "3".into()],
            },
            vehicles: ProviderConf {
                url: Some("http://telematics.oasa.gr/api/?act=getBusLocation&p1={resource}".into()),
                resources: Vec::new(),
            },
            focus: Some(FocusStation {
                line_id: "2".into(),
                station: "Syntagma".into(),
                line: "Line 2 (Red)".into(),
                direction: "Elliniko".into(),
            }),
        }
    }
}

impl Default for PersistenceConf {
    fn default() -> Self {
        Self { pulse_log: "./data/pulse_log.jsonl".into() }
    }
}

impl Default for PushConf {
    fn default() -> Self {
        Self { subscriber_buffer: 64 }
    }
}

impl PollingConf {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl RelayConfig {
    /// Applies `DEAFNAV_*` overrides on top of the file values.
    /// Unparseable numbers are logged and ignored.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DEAFNAV_MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("DEAFNAV_MQTT_PORT") {
            parse_into("DEAFNAV_MQTT_PORT", &v, &mut self.mqtt.port);
        }
        if let Some(v) = lookup("DEAFNAV_TELEMETRY_TOPIC") {
            self.mqtt.telemetry_topic = v;
        }
        if let Some(v) = lookup("DEAFNAV_POLL_INTERVAL_SECS") {
            parse_into("DEAFNAV_POLL_INTERVAL_SECS", &v, &mut self.polling.interval_secs);
        }
        if let Some(v) = lookup("DEAFNAV_CACHE_TTL_SECS") {
            parse_into("DEAFNAV_CACHE_TTL_SECS", &v, &mut self.polling.cache_ttl_secs);
        }
        if let Some(v) = lookup("DEAFNAV_PULSE_THRESHOLD") {
            parse_into("DEAFNAV_PULSE_THRESHOLD", &v, &mut self.alerts.pulse_threshold);
        }
        if let Some(v) = lookup("DEAFNAV_ELEVATORS_URL") {
            self.providers.elevators.url = Some(v);
        }
        if let Some(v) = lookup("DEAFNAV_VEHICLES_URL") {
            self.providers.vehicles.url = Some(v);
        }
        if let Some(v) = lookup("DEAFNAV_HTTP_BIND") {
            self.http.bind = v;
        }
        if let Some(v) = lookup("DEAFNAV_PULSE_LOG") {
            self.persistence.pulse_log = v;
        }
    }

    /// Presence checks only; values are trusted beyond that.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt.host"));
        }
        if self.mqtt.telemetry_topic.trim().is_empty() {
            return Err(ConfigError::Missing("mqtt.telemetry_topic"));
        }
        if self.http.bind.trim().is_empty() {
            return Err(ConfigError::Missing("http.bind"));
        }
        if self.persistence.pulse_log.trim().is_empty() {
            return Err(ConfigError::Missing("persistence.pulse_log"));
        }
        for (key, value) in [
            ("polling.interval_secs", self.polling.interval_secs),
            ("polling.cache_ttl_secs", self.polling.cache_ttl_secs),
            ("polling.fetch_timeout_secs", self.polling.fetch_timeout_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid { key, reason: "must be greater than zero".into() });
            }
        }
        if self.push.subscriber_buffer == 0 {
            return Err(ConfigError::Invalid {
                key: "push.subscriber_buffer",
                reason: "must be greater than zero".into(),
            });
        }
        check_provider("providers.elevators.url", &self.providers.elevators)?;
        check_provider("providers.vehicles.url", &self.providers.vehicles)?;
        Ok(())
    }
}

fn check_provider(key: &'static str, conf: &ProviderConf) -> Result<(), ConfigError> {
    if conf.resources.is_empty() {
        return Ok(());
    }
    match conf.url.as_deref().map(str::trim) {
        None | Some("") => Err(ConfigError::Missing(key)),
        Some(url) if !url.contains("{resource}") => Err(ConfigError::Invalid {
            key,
            reason: "url must contain a {resource} placeholder".into(),
        }),
        Some(_) => Ok(()),
    }
}

fn parse_into<T: std::str::FromStr>(key: &str, raw: &str, slot: &mut T) {
    match raw.trim().parse::<T>() {
        Ok(v) => *slot = v,
        Err(_) => warn!("[config] ignoring {key}={raw}: not a valid number"),
    }
}

pub fn parse_config(txt: &str) -> Result<RelayConfig, serde_yaml::Error> {
    if txt.trim().is_empty() {
        return Ok(RelayConfig::default());
    }
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> RelayConfig {
    let path = std::env::var("DEAFNAV_RELAY_CONFIG").unwrap_or_else(|_| "relay.yaml".into());
    let mut cfg = if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        parse_config(&txt).unwrap_or_else(|e| {
            warn!("[config] invalid {path}: {e}, using defaults");
            RelayConfig::default()
        })
    } else {
        info!("[config] no {path}, using default configuration");
        RelayConfig::default()
    };
    cfg.apply_env_overrides(|key| std::env::var(key).ok());
    cfg
}
