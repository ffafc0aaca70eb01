//! Discovery topic routing
//!
//! Maps each live discovery topic to the registry entry it created so that a
//! later removal on the same topic can be routed back. Not persisted: after
//! a restart the map is rebuilt from discovery traffic only.

use atorch_core::{AccessoryId, CanonicalMessage};
use serde::Serialize;
use std::collections::HashMap;

/// What a removal on a topic tears down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    /// A single service
    Service,
    /// The whole accessory with all its services
    Accessory,
}

/// Route for one discovery topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicEntry {
    pub topic: String,
    pub kind: EntityKind,
    pub service_key: String,
    pub accessory_id: AccessoryId,
}

impl TopicEntry {
    /// Classify a discovery topic. The device status sensor (a sensor without
    /// device class) owns the accessory; every other topic owns one service.
    pub fn classify(
        topic: &str,
        message: &CanonicalMessage,
        service_key: &str,
        accessory_id: AccessoryId,
    ) -> Self {
        let kind = if message.is_device_status() {
            EntityKind::Accessory
        } else {
            EntityKind::Service
        };
        Self {
            topic: topic.to_string(),
            kind,
            service_key: service_key.to_string(),
            accessory_id,
        }
    }
}

#[derive(Debug, Default)]
pub struct DiscoveryTopicMap {
    entries: HashMap<String, TopicEntry>,
}

impl DiscoveryTopicMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, entry: TopicEntry) {
        self.entries.insert(entry.topic.clone(), entry);
    }

    pub fn get(&self, topic: &str) -> Option<&TopicEntry> {
        self.entries.get(topic)
    }

    pub fn remove(&mut self, topic: &str) -> Option<TopicEntry> {
        self.entries.remove(topic)
    }

    /// Drop every route pointing at an accessory
    pub fn remove_accessory(&mut self, accessory_id: AccessoryId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.accessory_id != accessory_id);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
