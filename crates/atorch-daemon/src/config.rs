//! Configuration loading and validation

use anyhow::{bail, Result};
use atorch_discovery::BridgeConfig;
use atorch_mqtt::MqttConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub bridge: BridgeSection,
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub api: ApiSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    /// Hours without discovery traffic before an accessory is removed
    #[serde(default = "default_cleanup")]
    pub cleanup: f64,
    /// Debug logging for the bridge crates
    #[serde(default)]
    pub debug: bool,
    /// Path to the accessory snapshot
    #[serde(default = "default_snapshot")]
    pub snapshot: String,
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            cleanup: default_cleanup(),
            debug: false,
            snapshot: default_snapshot(),
        }
    }
}

fn default_cleanup() -> f64 {
    24.0
}

fn default_snapshot() -> String {
    "./atorch-accessories.json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSection {
    #[serde(default = "default_mqtt_host")]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Discovery subscription filter
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: default_mqtt_host(),
            port: default_mqtt_port(),
            username: None,
            password: None,
            topic: default_topic(),
            client_id: default_client_id(),
        }
    }
}

fn default_mqtt_host() -> String {
    "localhost".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_topic() -> String {
    "homeassistant/#".to_string()
}

fn default_client_id() -> String {
    "atorch-bridge".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSection {
    /// Bind address for the status API
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            enabled: true,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8581".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let cleanup = self.bridge.cleanup;
        if !cleanup.is_finite() || cleanup < 0.0 {
            bail!("bridge.cleanup must be a non-negative number of hours, got {cleanup}");
        }
        if self.mqtt.topic.is_empty() {
            bail!("mqtt.topic must not be empty");
        }
        Ok(())
    }

    /// Convert to BridgeConfig
    pub fn to_bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            cleanup_hours: self.bridge.cleanup,
        }
    }

    /// Convert to MqttConfig
    pub fn to_mqtt_config(&self) -> MqttConfig {
        MqttConfig {
            host: self.mqtt.host.clone(),
            port: self.mqtt.port,
            username: self.mqtt.username.clone(),
            password: self.mqtt.password.clone(),
            discovery_topic: self.mqtt.topic.clone(),
            client_id: self.mqtt.client_id.clone(),
            keep_alive: Duration::from_secs(60),
        }
    }
}

/// Load and validate configuration. A missing file yields the defaults.
pub fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)?
    } else {
        Config::default()
    };
    config.validate()?;
    Ok(config)
}
