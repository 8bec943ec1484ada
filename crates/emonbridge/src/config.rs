// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Bridge configuration.
//!
//! Loaded once from a TOML file at startup. A device family whose section is
//! missing is disabled; a section that is present but omits `enabled` is
//! enabled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level bridge configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Bus connection settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Sink endpoint settings.
    #[serde(default)]
    pub emoncms: EmoncmsConfig,

    /// Smart-meter reader family.
    #[serde(default)]
    pub slimmelezer: SlimmelezerConfig,

    /// EV charger property family.
    #[serde(default)]
    pub alfen: AlfenConfig,

    /// Energy manager loadpoint family.
    #[serde(default)]
    pub evcc: EvccConfig,

    /// Bus-wired sensor family.
    #[serde(default)]
    pub qbus: QbusConfig,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "emonbridge".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

fn default_max_inflight() -> u16 {
    200
}

fn default_retry_delay() -> u64 {
    60
}

fn default_restart_delay() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_sink_timeout() -> u64 {
    30
}

fn default_flush_interval() -> u64 {
    5
}

fn default_batched() -> DeliveryConfig {
    DeliveryConfig::Batched {
        flush_interval_secs: default_flush_interval(),
    }
}

fn default_immediate() -> DeliveryConfig {
    DeliveryConfig::Immediate
}

fn default_slimmelezer_device() -> String {
    "slimmelezer".to_string()
}

fn default_evcc_device() -> String {
    "alfen1".to_string()
}

/// MQTT bus connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Connect to the bus at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Broker host.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Client identifier presented to the broker.
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// Keep-alive interval (seconds).
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Maximum in-flight messages.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u16,

    /// Delay before retrying a failed connect (seconds).
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Settle delay before reconnecting after a close or error (seconds).
    #[serde(default = "default_restart_delay")]
    pub restart_delay_secs: u64,

    /// Bound on a single connect attempt (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
            client_id: default_client_id(),
            keep_alive_secs: default_keep_alive(),
            max_inflight: default_max_inflight(),
            retry_delay_secs: default_retry_delay(),
            restart_delay_secs: default_restart_delay(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl MqttConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// emoncms input API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmoncmsConfig {
    /// Post at all. When false, drained metrics are discarded.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL, `/input/post` is appended.
    #[serde(default)]
    pub endpoint: String,

    /// Write API key.
    #[serde(default)]
    pub apikey: String,

    /// Request timeout (seconds).
    #[serde(default = "default_sink_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmoncmsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: String::new(),
            apikey: String::new(),
            timeout_secs: default_sink_timeout(),
        }
    }
}

impl EmoncmsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// How a router entry hands decoded metrics to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DeliveryConfig {
    /// Deliver every decoded message right away.
    Immediate,

    /// Merge into a cache drained every `flush_interval_secs`.
    Batched {
        #[serde(default = "default_flush_interval")]
        flush_interval_secs: u64,
    },
}

/// Smart-meter reader (`slimmelezer/sensor/<item>/state`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlimmelezerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Device id posted to the sink.
    #[serde(default = "default_slimmelezer_device")]
    pub device: String,

    #[serde(default = "default_batched")]
    pub delivery: DeliveryConfig,

    /// Sensor item to metric name.
    #[serde(default)]
    pub items: BTreeMap<String, String>,
}

impl Default for SlimmelezerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: default_slimmelezer_device(),
            delivery: default_batched(),
            items: BTreeMap::new(),
        }
    }
}

/// EV charger properties (`alfen/properties/<meter>/category/<category>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlfenConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_immediate")]
    pub delivery: DeliveryConfig,

    /// Meter name to its category tables.
    #[serde(default)]
    pub properties: BTreeMap<String, AlfenMeterConfig>,
}

impl Default for AlfenConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delivery: default_immediate(),
            properties: BTreeMap::new(),
        }
    }
}

/// Category tables of one charger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlfenMeterConfig {
    /// Category name to (property id to metric name).
    #[serde(default)]
    pub category: BTreeMap<String, BTreeMap<String, String>>,
}

/// Energy manager loadpoints (`evcc/loadpoints/<id>/<kind>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvccConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Device id posted to the sink.
    #[serde(default = "default_evcc_device")]
    pub device: String,

    #[serde(default = "default_batched")]
    pub delivery: DeliveryConfig,

    /// Loadpoint id to metric names.
    #[serde(default)]
    pub loadpoints: BTreeMap<String, LoadpointConfig>,
}

impl Default for EvccConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: default_evcc_device(),
            delivery: default_batched(),
            loadpoints: BTreeMap::new(),
        }
    }
}

/// Metric names for one loadpoint. Unset kinds are not forwarded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadpointConfig {
    pub charge_total_import: Option<String>,
    pub charge_power: Option<String>,
    pub charge_current: Option<String>,
    pub charge_current_1: Option<String>,
    pub charge_current_2: Option<String>,
    pub charge_current_3: Option<String>,
    pub phases_active: Option<String>,
}

impl LoadpointConfig {
    fn names(&self) -> impl Iterator<Item = &String> {
        [
            &self.charge_total_import,
            &self.charge_power,
            &self.charge_current,
            &self.charge_current_1,
            &self.charge_current_2,
            &self.charge_current_3,
            &self.phases_active,
        ]
        .into_iter()
        .flatten()
    }
}

/// Bus-wired sensors (`qbus/<n>/sensor/<type>/<id>/state`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QbusConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_batched")]
    pub delivery: DeliveryConfig,

    /// Sensor type to (output id to metric name).
    #[serde(default)]
    pub types: BTreeMap<String, BTreeMap<String, String>>,
}

impl Default for QbusConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delivery: default_batched(),
            types: BTreeMap::new(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Self::from_file_with(path, |_| {})
    }

    /// Load a TOML file, let `adjust` override fields, then validate once.
    pub fn from_file_with<P, F>(path: P, adjust: F) -> Result<Self, ConfigError>
    where
        P: AsRef<Path>,
        F: FnOnce(&mut Self),
    {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;
        adjust(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mqtt = &self.mqtt;
        if mqtt.enabled {
            if mqtt.host.trim().is_empty() {
                return Err(ConfigError::Invalid("mqtt.host is empty".into()));
            }
            if mqtt.port == 0 {
                return Err(ConfigError::Invalid("mqtt.port must not be 0".into()));
            }
            if mqtt.client_id.is_empty() {
                return Err(ConfigError::Invalid("mqtt.client_id is empty".into()));
            }
            if mqtt.keep_alive_secs < 5 {
                return Err(ConfigError::Invalid(
                    "mqtt.keep_alive_secs must be at least 5".into(),
                ));
            }
            if mqtt.max_inflight == 0 {
                return Err(ConfigError::Invalid("mqtt.max_inflight must not be 0".into()));
            }
            if mqtt.connect_timeout_secs == 0 {
                return Err(ConfigError::Invalid(
                    "mqtt.connect_timeout_secs must not be 0".into(),
                ));
            }
            if mqtt.connect_timeout_secs > mqtt.retry_delay_secs {
                return Err(ConfigError::Invalid(format!(
                    "mqtt.connect_timeout_secs ({}) exceeds mqtt.retry_delay_secs ({})",
                    mqtt.connect_timeout_secs, mqtt.retry_delay_secs
                )));
            }
        }

        if self.emoncms.enabled && self.emoncms.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "emoncms.endpoint is required when emoncms is enabled".into(),
            ));
        }
        if self.emoncms.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "emoncms.timeout_secs must not be 0".into(),
            ));
        }

        validate_delivery("slimmelezer", &self.slimmelezer.delivery)?;
        validate_delivery("alfen", &self.alfen.delivery)?;
        validate_delivery("evcc", &self.evcc.delivery)?;
        validate_delivery("qbus", &self.qbus.delivery)?;

        if self.slimmelezer.device.is_empty() {
            return Err(ConfigError::Invalid("slimmelezer.device is empty".into()));
        }
        if self.evcc.device.is_empty() {
            return Err(ConfigError::Invalid("evcc.device is empty".into()));
        }

        validate_names("slimmelezer.items", self.slimmelezer.items.values())?;
        for (meter, props) in &self.alfen.properties {
            for (category, ids) in &props.category {
                validate_names(
                    &format!("alfen.properties.{}.category.{}", meter, category),
                    ids.values(),
                )?;
            }
        }
        for (id, loadpoint) in &self.evcc.loadpoints {
            validate_names(&format!("evcc.loadpoints.{}", id), loadpoint.names())?;
        }
        for (kind, ids) in &self.qbus.types {
            for id in ids.keys() {
                if id.parse::<u32>().is_err() {
                    return Err(ConfigError::Invalid(format!(
                        "qbus.types.{} has non-numeric output id '{}'",
                        kind, id
                    )));
                }
            }
            validate_names(&format!("qbus.types.{}", kind), ids.values())?;
        }

        Ok(())
    }

    /// Example configuration covering every device family.
    pub fn example() -> Self {
        let mut alfen_category = BTreeMap::new();
        alfen_category.insert(
            "meter".to_string(),
            BTreeMap::from([
                ("2221_3".to_string(), "voltage_l1".to_string()),
                ("2221_16".to_string(), "power".to_string()),
            ]),
        );

        Self {
            mqtt: MqttConfig::default(),
            emoncms: EmoncmsConfig {
                endpoint: "http://127.0.0.1/emoncms".into(),
                apikey: "replace-with-write-apikey".into(),
                ..Default::default()
            },
            slimmelezer: SlimmelezerConfig {
                enabled: true,
                items: BTreeMap::from([
                    ("power_consumed_phase_1".to_string(), "power1".to_string()),
                    ("power_consumed_phase_2".to_string(), "power2".to_string()),
                    ("power_consumed_phase_3".to_string(), "power3".to_string()),
                ]),
                ..Default::default()
            },
            alfen: AlfenConfig {
                enabled: true,
                properties: BTreeMap::from([(
                    "alfen1".to_string(),
                    AlfenMeterConfig {
                        category: alfen_category,
                    },
                )]),
                ..Default::default()
            },
            evcc: EvccConfig {
                enabled: true,
                loadpoints: BTreeMap::from([(
                    "1".to_string(),
                    LoadpointConfig {
                        charge_total_import: Some("energy_total".into()),
                        charge_power: Some("charge_power".into()),
                        charge_current: Some("charge_current".into()),
                        charge_current_1: Some("current_l1".into()),
                        charge_current_2: Some("current_l2".into()),
                        charge_current_3: Some("current_l3".into()),
                        phases_active: Some("phases".into()),
                    },
                )]),
                ..Default::default()
            },
            qbus: QbusConfig {
                enabled: true,
                types: BTreeMap::from([(
                    "thermostats".to_string(),
                    BTreeMap::from([("12".to_string(), "living".to_string())]),
                )]),
                ..Default::default()
            },
        }
    }
}

fn validate_delivery(family: &str, delivery: &DeliveryConfig) -> Result<(), ConfigError> {
    if let DeliveryConfig::Batched {
        flush_interval_secs: 0,
    } = delivery
    {
        return Err(ConfigError::Invalid(format!(
            "{}.delivery.flush_interval_secs must not be 0",
            family
        )));
    }
    Ok(())
}

fn validate_names<'a>(
    table: &str,
    mut names: impl Iterator<Item = &'a String>,
) -> Result<(), ConfigError> {
    if names.any(|n| n.trim().is_empty()) {
        return Err(ConfigError::Invalid(format!(
            "{} maps to an empty metric name",
            table
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_TOML: &str = r#"
[mqtt]
host = "broker.lan"
port = 1884
retry_delay_secs = 60
restart_delay_secs = 10

[emoncms]
endpoint = "http://emon.lan/emoncms"
apikey = "secret"

[slimmelezer]
[slimmelezer.items]
power_consumed_phase_1 = "power1"

[alfen]
[alfen.properties.m1.category.cat1]
"7" = "volt"

[evcc]
device = "charger"
delivery = { mode = "batched", flush_interval_secs = 10 }
[evcc.loadpoints.1]
charge_power = "power"

[qbus]
enabled = false
delivery = { mode = "immediate" }
"#;

    #[test]
    fn test_config_parse_full() {
        let config = BridgeConfig::from_toml(FULL_TOML).expect("parse");

        assert_eq!(config.mqtt.host, "broker.lan");
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.mqtt.restart_delay(), Duration::from_secs(10));
        assert_eq!(config.mqtt.max_inflight, 200);

        assert!(config.emoncms.enabled);
        assert_eq!(config.emoncms.apikey, "secret");

        assert!(config.slimmelezer.enabled);
        assert_eq!(config.slimmelezer.device, "slimmelezer");
        assert_eq!(config.slimmelezer.items["power_consumed_phase_1"], "power1");
        assert_eq!(
            config.slimmelezer.delivery,
            DeliveryConfig::Batched {
                flush_interval_secs: 5
            }
        );

        assert!(config.alfen.enabled);
        assert_eq!(config.alfen.delivery, DeliveryConfig::Immediate);
        assert_eq!(config.alfen.properties["m1"].category["cat1"]["7"], "volt");

        assert_eq!(config.evcc.device, "charger");
        assert_eq!(
            config.evcc.delivery,
            DeliveryConfig::Batched {
                flush_interval_secs: 10
            }
        );
        assert_eq!(
            config.evcc.loadpoints["1"].charge_power.as_deref(),
            Some("power")
        );
        assert!(config.evcc.loadpoints["1"].phases_active.is_none());

        assert!(!config.qbus.enabled);
        assert_eq!(config.qbus.delivery, DeliveryConfig::Immediate);
    }

    #[test]
    fn test_missing_sections_are_disabled() {
        let config = BridgeConfig::from_toml(
            r#"
[emoncms]
endpoint = "http://emon.lan"
"#,
        )
        .expect("parse");

        assert!(config.mqtt.enabled);
        assert_eq!(config.mqtt.port, 1883);
        assert!(!config.slimmelezer.enabled);
        assert!(!config.alfen.enabled);
        assert!(!config.evcc.enabled);
        assert!(!config.qbus.enabled);
    }

    #[test]
    fn test_validation_requires_endpoint() {
        let err = BridgeConfig::from_toml("").expect_err("endpoint missing");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let config = BridgeConfig::from_toml("[emoncms]\nenabled = false\n").expect("parse");
        assert!(!config.emoncms.enabled);
    }

    #[test]
    fn test_validation_rejects_zero_flush_interval() {
        let mut config = BridgeConfig::example();
        config.evcc.delivery = DeliveryConfig::Batched {
            flush_interval_secs: 0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_connect_timeout_above_retry_delay() {
        let mut config = BridgeConfig::example();
        config.mqtt.connect_timeout_secs = 120;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_metric_name() {
        let mut config = BridgeConfig::example();
        config
            .slimmelezer
            .items
            .insert("power_produced".into(), " ".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_non_numeric_qbus_id() {
        let mut config = BridgeConfig::example();
        config
            .qbus
            .types
            .insert("dimmers".into(), BTreeMap::from([("x".into(), "hall".into())]));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_example_roundtrips_through_toml() {
        let example = BridgeConfig::example();
        example.validate().expect("example is valid");

        let toml_str = toml::to_string_pretty(&example).expect("serialize");
        assert!(toml_str.contains("[slimmelezer.items]"));

        let parsed = BridgeConfig::from_toml(&toml_str).expect("reparse");
        assert_eq!(parsed.slimmelezer.items, example.slimmelezer.items);
        assert_eq!(parsed.evcc.delivery, example.evcc.delivery);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bridge.toml");
        std::fs::write(&path, FULL_TOML).expect("write");

        let config = BridgeConfig::from_file(&path).expect("load");
        assert_eq!(config.mqtt.host, "broker.lan");

        let missing = BridgeConfig::from_file(dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }

    #[test]
    fn test_overrides_apply_before_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bridge.toml");
        std::fs::write(
            &path,
            "[mqtt]\nport = 0\n\n[emoncms]\nendpoint = \"http://emon.lan\"\n",
        )
        .expect("write");

        assert!(matches!(
            BridgeConfig::from_file(&path),
            Err(ConfigError::Invalid(_))
        ));

        let config = BridgeConfig::from_file_with(&path, |c| c.mqtt.port = 1884).expect("load");
        assert_eq!(config.mqtt.port, 1884);
    }
}
