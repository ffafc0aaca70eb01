//! Accessory and service registry
//!
//! The registry owns every live accessory and service. Discovery messages
//! create or refresh entries, removal notices tear them down, and expiry
//! notices reap accessories that went quiet. All operations are synchronous
//! and run to completion; callers serialize them through the bridge loop.

use atorch_core::{
    normalize, Accessory, AccessoryId, BridgeError, Identity, RawMessage, Result,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::bridge::{BridgeConfig, BridgeEvent};
use crate::expiry::{Expired, ExpiryScheduler};
use crate::platform::{HostPlatform, MessageBus};
use crate::service::{Service, ServiceState};
use crate::topic_map::{DiscoveryTopicMap, EntityKind, TopicEntry};

/// Read-only view of a service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSummary {
    pub key: String,
    pub kind: String,
    pub name: String,
    pub state: ServiceState,
    pub available: bool,
}

/// Read-only view of an accessory and its attached services
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessorySummary {
    pub id: AccessoryId,
    pub display_name: String,
    pub services: Vec<ServiceSummary>,
    pub last_seen: Option<DateTime<Utc>>,
}

pub struct Registry {
    host: Arc<dyn HostPlatform>,
    bus: Arc<dyn MessageBus>,
    accessories: HashMap<AccessoryId, Accessory>,
    /// Flat map, service keys are unique across the fleet
    services: HashMap<String, Service>,
    topics: DiscoveryTopicMap,
    expiry: ExpiryScheduler,
}

impl Registry {
    /// Create a registry. The receiver yields expiry notices that must be
    /// fed back through [`Registry::expire`].
    pub fn new(
        host: Arc<dyn HostPlatform>,
        bus: Arc<dyn MessageBus>,
        config: &BridgeConfig,
    ) -> (Self, mpsc::UnboundedReceiver<Expired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Self {
            host,
            bus,
            accessories: HashMap::new(),
            services: HashMap::new(),
            topics: DiscoveryTopicMap::new(),
            expiry: ExpiryScheduler::from_hours(config.cleanup_hours, tx),
        };
        (registry, rx)
    }

    /// Adopt an accessory the host restored from its snapshot. The expiry
    /// timer is armed right away so a device that never announces itself
    /// again is still reaped.
    pub fn restore(&mut self, mut accessory: Accessory) {
        info!(name = %accessory.display_name, id = %accessory.id, "Loading accessory from cache");
        self.expiry.reset(&mut accessory);
        self.accessories.insert(accessory.id, accessory);
    }

    /// Reconcile a discovery message published on `topic`
    pub fn discover(&mut self, topic: &str, raw: &RawMessage) -> Result<Vec<BridgeEvent>> {
        let message = normalize(raw)?;
        let host = Arc::clone(&self.host);
        let Identity {
            accessory_id,
            service_key,
        } = Identity::derive(&message, |seed| host.generate_id(seed))?;
        let name = message.display_name();
        debug!(topic, name = %name, service = %service_key, "Discovered");

        let mut events = Vec::new();
        let is_new = !self.accessories.contains_key(&accessory_id);
        let accessory = self.accessories.entry(accessory_id).or_insert_with(|| {
            info!(name = %name, "Adding new accessory");
            Accessory::new(accessory_id, name.clone())
        });
        if is_new {
            events.push(BridgeEvent::AccessoryAdded {
                id: accessory_id,
                name: name.clone(),
            });
        } else {
            info!(name = %name, "Found existing accessory");
            events.push(BridgeEvent::AccessoryUpdated { id: accessory_id });
        }
        accessory.record_message(&service_key, message.clone());
        accessory.touch();

        match self.services.get_mut(&service_key) {
            Some(service) => {
                debug!(name = %name, service = %service_key, "Refreshing existing service");
                service.refresh(self.bus.as_ref(), &message);
                accessory.attach_service(&service_key);
                events.push(BridgeEvent::ServiceRefreshed {
                    accessory: accessory_id,
                    key: service_key.clone(),
                });
            }
            None => {
                match Service::create(self.bus.as_ref(), accessory_id, &service_key, &message) {
                    Some(service) => {
                        info!(name = %name, kind = %service.kind(), "Creating service");
                        accessory.attach_service(&service_key);
                        events.push(BridgeEvent::ServiceAdded {
                            accessory: accessory_id,
                            key: service_key.clone(),
                            kind: service.kind().to_string(),
                        });
                        self.services.insert(service_key.clone(), service);
                    }
                    None => {
                        let error = BridgeError::UnknownEntityType(message.kind().to_string());
                        warn!(name = %name, error = %error, "Skipping service");
                    }
                }
            }
        }

        self.topics
            .set(TopicEntry::classify(topic, &message, &service_key, accessory_id));

        let persisted = if is_new {
            self.host.register_accessories(&[&*accessory])
        } else {
            self.host.update_accessories(&[&*accessory])
        };
        self.expiry.reset(accessory);
        persisted?;

        Ok(events)
    }

    /// Handle a withdrawn discovery topic
    pub fn remove(&mut self, topic: &str) -> Result<Vec<BridgeEvent>> {
        let Some(entry) = self.topics.get(topic).cloned() else {
            let error = BridgeError::OrphanRemoval(format!("topic {topic}"));
            debug!(error = %error, "Removal ignored");
            return Ok(Vec::new());
        };
        if !self.accessories.contains_key(&entry.accessory_id) {
            let error = BridgeError::OrphanRemoval(format!("accessory {}", entry.accessory_id));
            debug!(topic, error = %error, "Removal ignored");
            return Ok(Vec::new());
        }

        let result = match entry.kind {
            EntityKind::Service => self.remove_service(&entry),
            EntityKind::Accessory => self.remove_accessory(entry.accessory_id),
        };
        self.topics.remove(topic);
        result
    }

    fn remove_service(&mut self, entry: &TopicEntry) -> Result<Vec<BridgeEvent>> {
        let Some(service) = self.services.remove(&entry.service_key) else {
            let error = BridgeError::OrphanRemoval(format!("service {}", entry.service_key));
            debug!(error = %error, "Removal ignored");
            return Ok(Vec::new());
        };
        info!(name = %service.name(), "Removing service");
        service.teardown(self.bus.as_ref());

        let Some(accessory) = self.accessories.get_mut(&entry.accessory_id) else {
            return Ok(Vec::new());
        };
        accessory.detach_service(&entry.service_key);
        self.host.update_accessories(&[&*accessory])?;

        Ok(vec![BridgeEvent::ServiceRemoved {
            accessory: entry.accessory_id,
            key: entry.service_key.clone(),
        }])
    }

    fn remove_accessory(&mut self, id: AccessoryId) -> Result<Vec<BridgeEvent>> {
        let Some(mut accessory) = self.accessories.remove(&id) else {
            return Ok(Vec::new());
        };
        info!(name = %accessory.display_name, "Removing accessory");

        let keys: Vec<String> = self
            .services
            .iter()
            .filter(|(_, service)| service.accessory_id() == id)
            .map(|(key, _)| key.clone())
            .collect();

        let mut events = Vec::with_capacity(keys.len() + 1);
        for key in keys {
            if let Some(service) = self.services.remove(&key) {
                info!(name = %service.name(), "Removing service");
                service.teardown(self.bus.as_ref());
            }
            accessory.detach_service(&key);
            events.push(BridgeEvent::ServiceRemoved {
                accessory: id,
                key,
            });
        }

        self.expiry.cancel(&mut accessory);
        let purged = self.topics.remove_accessory(id);
        trace!(accessory = %id, purged, "Dropped topic routes");

        let updated = self.host.update_accessories(&[&accessory]);
        self.host.unregister_accessories(&[&accessory])?;
        updated?;

        events.push(BridgeEvent::AccessoryRemoved { id });
        Ok(events)
    }

    /// Reap an accessory whose timer ran out.
    ///
    /// Services of the accessory are left subscribed and are reattached if
    /// the device is discovered again.
    pub fn expire(&mut self, expired: Expired) -> Result<Vec<BridgeEvent>> {
        if !self.expiry.fired(expired.token) {
            trace!(accessory = %expired.accessory, token = expired.token.0, "Timer was reset");
            return Ok(Vec::new());
        }
        let current = self
            .accessories
            .get(&expired.accessory)
            .is_some_and(|a| a.context.timeout == Some(expired.token));
        if !current {
            let error = BridgeError::OrphanRemoval(format!("accessory {}", expired.accessory));
            debug!(error = %error, "Expiry ignored");
            return Ok(Vec::new());
        }
        let Some(mut accessory) = self.accessories.remove(&expired.accessory) else {
            return Ok(Vec::new());
        };
        accessory.context.timeout = None;

        error!("Removing {}", accessory.display_name);
        self.host.unregister_accessories(&[&accessory])?;

        Ok(vec![BridgeEvent::AccessoryExpired { id: accessory.id }])
    }

    /// Route a status or availability payload to the services listening on
    /// `topic`
    pub fn handle_message(&mut self, topic: &str, payload: &str) -> Vec<BridgeEvent> {
        self.services
            .values_mut()
            .filter(|service| service.listens_to(topic))
            .filter_map(|service| {
                let state = service.handle_message(topic, payload)?;
                Some(BridgeEvent::ServiceState {
                    accessory: service.accessory_id(),
                    key: service.key().to_string(),
                    state,
                    available: service.is_available(),
                })
            })
            .collect()
    }

    pub fn accessories(&self) -> impl Iterator<Item = &Accessory> {
        self.accessories.values()
    }

    pub fn accessory(&self, id: &AccessoryId) -> Option<&Accessory> {
        self.accessories.get(id)
    }

    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.services.values()
    }

    pub fn service(&self, key: &str) -> Option<&Service> {
        self.services.get(key)
    }

    pub fn topic_entry(&self, topic: &str) -> Option<&TopicEntry> {
        self.topics.get(topic)
    }

    pub fn topics(&self) -> &DiscoveryTopicMap {
        &self.topics
    }

    /// Snapshot of every known accessory, ordered by name
    pub fn summaries(&self) -> Vec<AccessorySummary> {
        let mut summaries: Vec<AccessorySummary> = self
            .accessories
            .values()
            .map(|accessory| AccessorySummary {
                id: accessory.id,
                display_name: accessory.display_name.clone(),
                services: accessory
                    .service_keys()
                    .filter_map(|key| self.services.get(key))
                    .map(|service| ServiceSummary {
                        key: service.key().to_string(),
                        kind: service.kind().to_string(),
                        name: service.name().to_string(),
                        state: service.state(),
                        available: service.is_available(),
                    })
                    .collect(),
                last_seen: accessory.last_seen(),
            })
            .collect();
        summaries.sort_by(|a, b| a.display_name.cmp(&b.display_name).then(a.id.cmp(&b.id)));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostCall, RecordingBus, RecordingHost};
    use atorch_core::TimerToken;
    use serde_json::json;
    use std::time::Duration;

    struct Fixture {
        registry: Registry,
        expired: mpsc::UnboundedReceiver<Expired>,
        host: Arc<RecordingHost>,
        bus: Arc<RecordingBus>,
    }

    fn fixture(cleanup_hours: f64) -> Fixture {
        let host = Arc::new(RecordingHost::default());
        let bus = Arc::new(RecordingBus::default());
        let (registry, expired) = Registry::new(
            host.clone(),
            bus.clone(),
            &BridgeConfig { cleanup_hours },
        );
        Fixture {
            registry,
            expired,
            host,
            bus,
        }
    }

    fn switch(uniq_id: &str, device: &str) -> RawMessage {
        json!({
            "name": format!("{uniq_id} switch"),
            "unique_id": uniq_id,
            "device": { "identifiers": [device], "name": "DL24" },
            "atorchType": "switch",
            "stat_t": format!("atorch/{device}/{uniq_id}/POWER"),
            "avty_t": format!("atorch/{device}/LWT")
        })
    }

    fn status_sensor(uniq_id: &str, device: &str) -> RawMessage {
        json!({
            "name": format!("{uniq_id} status"),
            "uniq_id": uniq_id,
            "dev": { "ids": [device] },
            "atorchType": "sensor",
            "stat_t": format!("atorch/{device}/HASS_STATE")
        })
    }

    #[tokio::test]
    async fn test_end_to_end_scenario() {
        let mut f = fixture(24.0);
        let dev1 = AccessoryId::generate("dev1");

        f.registry
            .discover("t1", &json!({ "uniq_id": "a1", "dev": { "ids": ["dev1"] }, "atorchType": "switch" }))
            .unwrap();
        assert_eq!(f.registry.accessories().count(), 1);
        assert!(f.registry.accessory(&dev1).is_some());
        assert_eq!(f.registry.service("a1").unwrap().kind().as_str(), "switch");
        assert_eq!(f.registry.topic_entry("t1").unwrap().kind, EntityKind::Service);

        f.registry
            .discover("t2", &json!({ "uniq_id": "a2", "dev": { "ids": ["dev1"] }, "atorchType": "sensor" }))
            .unwrap();
        assert_eq!(f.registry.accessories().count(), 1);
        assert_eq!(f.registry.service("a2").unwrap().kind().as_str(), "sensor");
        assert_eq!(f.registry.topic_entry("t2").unwrap().kind, EntityKind::Accessory);
        assert_eq!(f.registry.accessory(&dev1).unwrap().service_keys().count(), 2);

        let events = f.registry.remove("t2").unwrap();
        assert_eq!(events.last(), Some(&BridgeEvent::AccessoryRemoved { id: dev1 }));
        assert_eq!(f.registry.accessories().count(), 0);
        assert_eq!(f.registry.services().count(), 0);
        assert!(f.registry.topics().is_empty());
        assert_eq!(f.registry.expiry.active(), 0);
        assert_eq!(
            f.host.calls(),
            vec![
                HostCall::Register(vec![dev1]),
                HostCall::Update(vec![dev1]),
                HostCall::Update(vec![dev1]),
                HostCall::Unregister(vec![dev1]),
            ]
        );
    }

    #[tokio::test]
    async fn test_discovery_is_idempotent() {
        let mut f = fixture(24.0);
        let message = switch("a1", "dev1");

        f.registry.discover("t1", &message).unwrap();
        let events = f.registry.discover("t1", &message).unwrap();

        assert!(events.iter().any(|e| matches!(e, BridgeEvent::ServiceRefreshed { .. })));
        assert!(!events.iter().any(|e| matches!(e, BridgeEvent::ServiceAdded { .. })));
        assert_eq!(f.registry.accessories().count(), 1);
        assert_eq!(f.registry.services().count(), 1);
        assert_eq!(f.registry.topics().len(), 1);
        // Refresh keeps the existing subscriptions
        assert_eq!(f.bus.subscribe_calls(), 2);
        assert_eq!(f.host.count(|c| matches!(c, HostCall::Register(_))), 1);
        assert_eq!(f.host.count(|c| matches!(c, HostCall::Update(_))), 1);
        assert_eq!(f.registry.expiry.active(), 1);
    }

    #[tokio::test]
    async fn test_remove_service_keeps_accessory() {
        let mut f = fixture(24.0);
        let dev1 = AccessoryId::generate("dev1");
        f.registry.discover("t1", &switch("a1", "dev1")).unwrap();
        f.registry.discover("t2", &status_sensor("a2", "dev1")).unwrap();

        let events = f.registry.remove("t1").unwrap();
        assert_eq!(
            events,
            vec![BridgeEvent::ServiceRemoved {
                accessory: dev1,
                key: "a1".to_string()
            }]
        );
        assert!(f.registry.service("a1").is_none());
        assert!(f.registry.service("a2").is_some());
        assert!(f.registry.topic_entry("t1").is_none());

        let accessory = f.registry.accessory(&dev1).unwrap();
        assert!(!accessory.has_service("a1"));
        assert!(accessory.message("a1").is_none());
        assert_eq!(f.bus.active_topics(), ["atorch/dev1/HASS_STATE"]);
    }

    #[tokio::test]
    async fn test_discover_then_remove_leaves_nothing() {
        let mut f = fixture(24.0);
        f.registry.discover("t", &status_sensor("s1", "dev1")).unwrap();
        f.registry.remove("t").unwrap();

        assert_eq!(f.registry.accessories().count(), 0);
        assert_eq!(f.registry.services().count(), 0);
        assert!(f.registry.topics().is_empty());
        assert!(f.bus.active_topics().is_empty());
    }

    #[tokio::test]
    async fn test_stray_removal_is_noop() {
        let mut f = fixture(24.0);
        f.registry.discover("t1", &switch("a1", "dev1")).unwrap();
        f.host.clear();

        assert!(f.registry.remove("nowhere").unwrap().is_empty());
        assert_eq!(f.registry.accessories().count(), 1);
        assert_eq!(f.registry.services().count(), 1);
        assert_eq!(f.registry.topics().len(), 1);
        assert!(f.host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_still_classifies_topic() {
        let mut f = fixture(24.0);
        let events = f
            .registry
            .discover(
                "t1",
                &json!({ "uniq_id": "f1", "dev": { "ids": ["dev1"] }, "atorchType": "fan" }),
            )
            .unwrap();

        assert!(matches!(events[0], BridgeEvent::AccessoryAdded { .. }));
        assert_eq!(events.len(), 1);
        assert_eq!(f.registry.services().count(), 0);
        assert!(f.registry.topic_entry("t1").is_some());
        assert_eq!(f.host.count(|c| matches!(c, HostCall::Register(_))), 1);
    }

    #[tokio::test]
    async fn test_invalid_message_mutates_nothing() {
        let mut f = fixture(24.0);
        let result = f
            .registry
            .discover("t1", &json!({ "uniq_id": "a1", "atorchType": "switch" }));

        assert!(matches!(result, Err(BridgeError::InvalidMessage(_))));
        assert_eq!(f.registry.accessories().count(), 0);
        assert!(f.registry.topics().is_empty());
        assert!(f.host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_host_failure_still_arms_timer() {
        let mut f = fixture(24.0);
        f.host.fail_calls(true);

        let result = f.registry.discover("t1", &switch("a1", "dev1"));
        assert!(matches!(result, Err(BridgeError::Host(_))));

        let accessory = f.registry.accessory(&AccessoryId::generate("dev1")).unwrap();
        assert!(accessory.context.timeout.is_some());
        assert!(f.registry.topic_entry("t1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rediscovery_defers_expiry() {
        let mut f = fixture(1.0);
        let dev1 = AccessoryId::generate("dev1");
        f.registry.discover("t1", &switch("a1", "dev1")).unwrap();

        tokio::time::sleep(Duration::from_secs(30 * 60)).await;
        f.registry.discover("t1", &switch("a1", "dev1")).unwrap();
        let armed = f.registry.accessory(&dev1).unwrap().context.timeout.unwrap();

        tokio::time::sleep(Duration::from_secs(45 * 60)).await;
        assert!(f.expired.try_recv().is_err());
        assert!(!f.host.calls().iter().any(|c| matches!(c, HostCall::Unregister(_))));

        let expired = f.expired.recv().await.unwrap();
        assert_eq!(expired.token, armed);
        let events = f.registry.expire(expired).unwrap();
        assert_eq!(events, vec![BridgeEvent::AccessoryExpired { id: dev1 }]);
        assert!(f.registry.accessory(&dev1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_window_reaps_only_that_accessory() {
        let mut f = fixture(0.0);
        f.registry.discover("t1", &switch("a1", "dev1")).unwrap();
        f.registry.discover("t2", &switch("b1", "dev2")).unwrap();
        f.host.clear();

        let expired = f.expired.recv().await.unwrap();
        f.registry.expire(expired).unwrap();

        assert_eq!(f.host.calls(), vec![HostCall::Unregister(vec![expired.accessory])]);
        assert_eq!(f.registry.accessories().count(), 1);
        assert!(f.registry.accessory(&expired.accessory).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_expiry_is_ignored() {
        let mut f = fixture(24.0);
        let dev1 = AccessoryId::generate("dev1");
        f.registry.discover("t1", &switch("a1", "dev1")).unwrap();
        let first = f.registry.accessory(&dev1).unwrap().context.timeout.unwrap();
        f.registry.discover("t1", &switch("a1", "dev1")).unwrap();
        f.host.clear();

        let events = f
            .registry
            .expire(Expired {
                accessory: dev1,
                token: first,
            })
            .unwrap();
        assert!(events.is_empty());
        assert!(f.registry.accessory(&dev1).is_some());
        assert!(f.host.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_services_reattach_on_rediscovery() {
        let mut f = fixture(0.0);
        let dev1 = AccessoryId::generate("dev1");
        f.registry.discover("t1", &switch("a1", "dev1")).unwrap();

        let expired = f.expired.recv().await.unwrap();
        f.registry.expire(expired).unwrap();
        assert!(f.registry.accessory(&dev1).is_none());
        // Subscriptions are left in place after expiry
        assert_eq!(f.bus.active_topics().len(), 2);
        assert!(f.registry.service("a1").is_some());

        f.host.clear();
        let events = f.registry.discover("t1", &switch("a1", "dev1")).unwrap();
        assert!(matches!(events[0], BridgeEvent::AccessoryAdded { .. }));
        assert!(matches!(events[1], BridgeEvent::ServiceRefreshed { .. }));
        assert!(f.registry.accessory(&dev1).unwrap().has_service("a1"));
        assert_eq!(f.host.calls(), vec![HostCall::Register(vec![dev1])]);
        assert_eq!(f.bus.subscribe_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_after_expiry_keeps_route() {
        let mut f = fixture(0.0);
        let dev1 = AccessoryId::generate("dev1");
        f.registry.discover("t1", &switch("a1", "dev1")).unwrap();

        let expired = f.expired.recv().await.unwrap();
        f.registry.expire(expired).unwrap();
        f.host.clear();

        let events = f.registry.remove("t1").unwrap();
        assert!(events.is_empty());
        assert!(f.host.calls().is_empty());
        let entry = f.registry.topic_entry("t1").unwrap();
        assert_eq!(entry.accessory_id, dev1);
        assert!(f.registry.service("a1").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_arms_timer() {
        let mut f = fixture(24.0);
        let dev1 = AccessoryId::generate("dev1");
        let mut cached = Accessory::new(dev1, "Cached meter");
        cached.context.timeout = Some(TimerToken(99));

        f.registry.restore(cached);
        let accessory = f.registry.accessory(&dev1).unwrap();
        assert_ne!(accessory.context.timeout, Some(TimerToken(99)));
        assert_eq!(f.registry.expiry.active(), 1);
        assert!(f.host.calls().is_empty());

        f.registry.discover("t1", &switch("a1", "dev1")).unwrap();
        assert_eq!(f.host.calls(), vec![HostCall::Update(vec![dev1])]);
        assert_eq!(f.registry.expiry.active(), 1);
    }

    #[tokio::test]
    async fn test_message_updates_state() {
        let mut f = fixture(24.0);
        f.registry.discover("t1", &switch("a1", "dev1")).unwrap();

        let events = f.registry.handle_message("atorch/dev1/a1/POWER", "ON");
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            BridgeEvent::ServiceState { state: ServiceState::On, available: true, .. }
        ));
        assert!(f.registry.handle_message("atorch/dev1/a1/POWER", "ON").is_empty());
        assert!(f.registry.handle_message("unrelated", "ON").is_empty());

        let summary = &f.registry.summaries()[0];
        assert_eq!(summary.display_name, "a1 switch");
        assert_eq!(summary.services[0].state, ServiceState::On);
    }
}
