//! Accessory records exposed to the host platform

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::identity::AccessoryId;
use crate::message::CanonicalMessage;

/// Opaque token naming an armed expiry timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TimerToken(pub u64);

/// Mutable bag persisted verbatim by the host platform
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessoryContext {
    /// Last message seen per service key
    #[serde(default)]
    pub device: BTreeMap<String, CanonicalMessage>,
    /// Expiry timer currently armed for this accessory
    #[serde(default)]
    pub timeout: Option<TimerToken>,
}

/// One physical device exposed as a unit to the host platform
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Accessory {
    pub id: AccessoryId,
    pub display_name: String,
    pub context: AccessoryContext,
    /// Keys of the services currently attached
    #[serde(skip)]
    services: BTreeSet<String>,
    /// When discovery traffic for this accessory was last seen
    #[serde(skip)]
    last_seen: Option<DateTime<Utc>>,
}

impl Accessory {
    pub fn new(id: AccessoryId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            context: AccessoryContext::default(),
            services: BTreeSet::new(),
            last_seen: None,
        }
    }

    /// Rebuild an accessory from persisted state
    pub fn restored(id: AccessoryId, display_name: String, context: AccessoryContext) -> Self {
        Self {
            context,
            ..Self::new(id, display_name)
        }
    }

    /// Record the latest message for a service key
    pub fn record_message(&mut self, service_key: &str, message: CanonicalMessage) {
        self.context.device.insert(service_key.to_string(), message);
    }

    pub fn message(&self, service_key: &str) -> Option<&CanonicalMessage> {
        self.context.device.get(service_key)
    }

    pub fn attach_service(&mut self, service_key: &str) {
        self.services.insert(service_key.to_string());
    }

    /// Detach a service, forgetting its last message. Returns false when the
    /// service was not attached.
    pub fn detach_service(&mut self, service_key: &str) -> bool {
        self.context.device.remove(service_key);
        self.services.remove(service_key)
    }

    pub fn service_keys(&self) -> impl Iterator<Item = &str> {
        self.services.iter().map(String::as_str)
    }

    pub fn has_service(&self, service_key: &str) -> bool {
        self.services.contains(service_key)
    }

    /// Update the last seen timestamp
    pub fn touch(&mut self) {
        self.last_seen = Some(Utc::now());
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_service_attachment() {
        let mut accessory = Accessory::new(AccessoryId::generate("dev1"), "Meter");
        let msg = CanonicalMessage::from_value(json!({ "uniq_id": "a1" })).unwrap();

        accessory.record_message("a1", msg.clone());
        accessory.attach_service("a1");
        assert!(accessory.has_service("a1"));
        assert_eq!(accessory.message("a1"), Some(&msg));

        assert!(accessory.detach_service("a1"));
        assert!(!accessory.detach_service("a1"));
        assert!(accessory.message("a1").is_none());
        assert_eq!(accessory.service_keys().count(), 0);
    }

    #[test]
    fn test_context_serialization() {
        let mut accessory = Accessory::new(AccessoryId::generate("dev1"), "Meter");
        accessory.context.timeout = Some(TimerToken(7));
        accessory.attach_service("a1");
        accessory.touch();

        let value = serde_json::to_value(&accessory).unwrap();
        assert_eq!(value["context"]["timeout"], json!(7));
        assert!(value.get("services").is_none());

        let back: Accessory = serde_json::from_value(value).unwrap();
        assert_eq!(back.context, accessory.context);
        assert_eq!(back.service_keys().count(), 0);
        assert!(back.last_seen().is_none());
    }
}
