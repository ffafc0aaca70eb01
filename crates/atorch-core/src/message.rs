//! Canonical device descriptor produced by the normalizer

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::debug;

/// Discovery payload exactly as received from the bus
pub type RawMessage = Value;

/// Capability advertised by a discovery message (`atorchType`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Switch,
    Light,
    Sensor,
    BinarySensor,
    /// Any other value, kept verbatim for diagnostics
    Unrecognized(String),
}

impl EntityType {
    pub fn parse(value: &str) -> Self {
        match value {
            "switch" => Self::Switch,
            "light" => Self::Light,
            "sensor" => Self::Sensor,
            "binary_sensor" => Self::BinarySensor,
            other => Self::Unrecognized(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Switch => "switch",
            Self::Light => "light",
            Self::Sensor => "sensor",
            Self::BinarySensor => "binary_sensor",
            Self::Unrecognized(other) => other,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized(_))
    }
}

impl From<String> for EntityType {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device block (`dev`) shared by every entity of one physical device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceBlock {
    /// Device identifiers; the first one seeds the accessory id
    #[serde(rename = "ids", default, deserialize_with = "string_or_seq")]
    pub identifiers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(rename = "mdl", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub model: Option<String>,
    #[serde(rename = "sw", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub sw_version: Option<String>,
    #[serde(rename = "mf", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub manufacturer: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A discovery message after key renaming and topic prefix expansion.
///
/// Only the fields the bridge acts on are typed; everything else is kept in
/// `extra` so the message round-trips through the accessory snapshot intact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// Service-scoped unique id
    #[serde(rename = "uniq_id", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub unique_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(rename = "atorchType", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_entity_type")]
    pub entity_type: Option<EntityType>,
    /// Present on typed sensors, absent on the device status sensor
    #[serde(rename = "dev_cla", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub device_class: Option<String>,
    #[serde(rename = "dev", default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceBlock>,
    #[serde(rename = "stat_t", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub state_topic: Option<String>,
    #[serde(rename = "avty_t", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub availability_topic: Option<String>,
    #[serde(rename = "pl_on", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub payload_on: Option<String>,
    #[serde(rename = "pl_off", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub payload_off: Option<String>,
    #[serde(rename = "pl_avail", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub payload_available: Option<String>,
    #[serde(rename = "pl_not_avail", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub payload_not_available: Option<String>,
    /// Shared topic prefix, substituted for `~` in every string field
    #[serde(rename = "~", default, skip_serializing_if = "Option::is_none", deserialize_with = "lenient_string")]
    pub topic_prefix: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CanonicalMessage {
    /// Parse a message that has already been normalized
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Entity kind, `Unrecognized("")` when the message carries none
    pub fn kind(&self) -> EntityType {
        self.entity_type
            .clone()
            .unwrap_or_else(|| EntityType::Unrecognized(String::new()))
    }

    /// Device identifiers, empty when there is no device block
    pub fn device_identifiers(&self) -> &[String] {
        self.device
            .as_ref()
            .map(|d| d.identifiers.as_slice())
            .unwrap_or(&[])
    }

    /// A sensor without a device class reports the whole device's status
    pub fn is_device_status(&self) -> bool {
        self.kind() == EntityType::Sensor && self.device_class.is_none()
    }

    /// Name shown for the accessory or service
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.device.as_ref().and_then(|d| d.name.clone()))
            .or_else(|| self.unique_id.clone())
            .unwrap_or_else(|| "ATorch device".to_string())
    }
}

/// Accept strings, numbers and booleans where a string is expected.
/// Objects and arrays are dropped.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(other) => {
            debug!(value = %other, "Ignoring non-scalar field value");
            None
        }
        None => None,
    })
}

/// Any non-string type tag is kept as an unrecognized type
fn lenient_entity_type<'de, D>(deserializer: D) -> Result<Option<EntityType>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None => None,
        Some(Value::String(s)) => Some(EntityType::parse(&s)),
        Some(other) => Some(EntityType::Unrecognized(other.to_string())),
    })
}

/// Identifiers may be published as a single string or a list
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => vec![s],
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}
