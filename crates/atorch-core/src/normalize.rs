//! Discovery message normalization
//!
//! ATorch firmwares publish slightly different flavours of the same
//! discovery message. Normalization happens in three order-dependent steps:
//! 1. Every mapping key is renamed through [`KEY_TRANSLATIONS`], recursing
//!    into nested mappings and sequences alike.
//! 2. When the message carries a topic prefix (`~`), every occurrence of `~`
//!    in string values is replaced by the prefix. Nested mappings are
//!    visited, sequences are passed through untouched.
//! 3. The state topic is checked against the firmware default topics, which
//!    would make several devices talk over each other.

use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{BridgeError, Result};
use crate::message::{CanonicalMessage, RawMessage};

/// Key holding the shared topic prefix, also the placeholder it replaces
pub const TOPIC_PREFIX_KEY: &str = "~";

/// Long-form key names and their canonical abbreviation
pub const KEY_TRANSLATIONS: &[(&str, &str)] = &[
    ("unique_id", "uniq_id"),
    ("device_class", "dev_cla"),
    ("payload_on", "pl_on"),
    ("payload_off", "pl_off"),
    ("device", "dev"),
    ("model", "mdl"),
    ("sw_version", "sw"),
    ("manufacturer", "mf"),
    ("identifiers", "ids"),
    ("state_topic", "stat_t"),
    ("availability_topic", "avty_t"),
    ("payload_available", "pl_avail"),
    ("payload_not_available", "pl_not_avail"),
];

/// Firmware default state topics; a device still using one is misconfigured
pub const DEFAULT_STATE_TOPICS: &[&str] = &["sonoff/tele/STATE", "atorch/tele/STATE"];

/// Normalize a raw discovery payload into a [`CanonicalMessage`]
pub fn normalize(raw: &RawMessage) -> Result<CanonicalMessage> {
    if !raw.is_object() {
        return Err(BridgeError::InvalidMessage(format!(
            "expected a JSON object, got {}",
            json_kind(raw)
        )));
    }

    let value = normalize_value(raw.clone());
    let message = CanonicalMessage::from_value(value)
        .map_err(|e| BridgeError::InvalidMessage(e.to_string()))?;

    if let Some(hazard) = check_state_topic(&message) {
        warn!(error = %hazard, "Misconfigured device");
    }

    Ok(message)
}

/// Key renaming and prefix expansion, without parsing into typed fields
pub fn normalize_value(raw: Value) -> Value {
    let renamed = rename_keys(raw);
    match renamed {
        Value::Object(map) => {
            let prefix = match map.get(TOPIC_PREFIX_KEY) {
                Some(Value::String(prefix)) if !prefix.is_empty() => Some(prefix.clone()),
                _ => None,
            };
            match prefix {
                Some(prefix) => Value::Object(expand_topic_prefix(map, &prefix)),
                None => Value::Object(map),
            }
        }
        other => other,
    }
}

/// Recursively rename keys through [`KEY_TRANSLATIONS`]
pub fn rename_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (canonical_key(key), rename_keys(value)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(rename_keys).collect()),
        other => other,
    }
}

/// Replace the `~` placeholder in every string value of a mapping.
///
/// Nested mappings are expanded; sequence values are kept as they are, even
/// when their elements contain the placeholder.
pub fn expand_topic_prefix(map: Map<String, Value>, prefix: &str) -> Map<String, Value> {
    map.into_iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(s) => Value::String(s.replace(TOPIC_PREFIX_KEY, prefix)),
                Value::Object(nested) => Value::Object(expand_topic_prefix(nested, prefix)),
                other => other,
            };
            (key, value)
        })
        .collect()
}

/// Report a state topic that collides with a firmware default
pub fn check_state_topic(message: &CanonicalMessage) -> Option<BridgeError> {
    let topic = message.state_topic.as_deref()?;
    DEFAULT_STATE_TOPICS
        .contains(&topic)
        .then(|| BridgeError::MisconfiguredTopic {
            name: message.display_name(),
            topic: topic.to_string(),
        })
}

fn canonical_key(key: String) -> String {
    KEY_TRANSLATIONS
        .iter()
        .find(|(long, _)| *long == key)
        .map(|(_, short)| short.to_string())
        .unwrap_or(key)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
