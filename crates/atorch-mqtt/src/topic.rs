//! Classification of incoming publishes

use atorch_core::RawMessage;
use atorch_discovery::BusEvent;
use serde_json::Value;
use tracing::warn;

use crate::error::MqttError;

/// Discovery descriptors are published on `<prefix>/<component>/<id>/config`
pub const CONFIG_SUFFIX: &str = "/config";

/// Turn a publish into a bus event.
///
/// An empty payload on a config topic withdraws the descriptor. Config
/// payloads that are not JSON objects are dropped.
pub fn classify(topic: &str, payload: &[u8]) -> Option<BusEvent> {
    if !topic.ends_with(CONFIG_SUFFIX) {
        return Some(BusEvent::Message {
            topic: topic.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
        });
    }

    if payload.iter().all(u8::is_ascii_whitespace) {
        return Some(BusEvent::Removed {
            topic: topic.to_string(),
        });
    }

    match parse_discovery(payload) {
        Ok(message) => Some(BusEvent::Discovered {
            topic: topic.to_string(),
            message,
        }),
        Err(e) => {
            warn!(topic, error = %e, "Dropping discovery publish");
            None
        }
    }
}

fn parse_discovery(payload: &[u8]) -> Result<RawMessage, MqttError> {
    match serde_json::from_slice::<Value>(payload) {
        Ok(value @ Value::Object(_)) => Ok(value),
        Ok(_) => Err(MqttError::Payload("not a JSON object".to_string())),
        Err(e) => Err(MqttError::Payload(e.to_string())),
    }
}
