//! Bridge event loop
//!
//! Bus events and expiry notices are pulled from their channels and handled
//! one at a time against the registry. After each handler the read-only
//! accessory view is refreshed and the resulting [`BridgeEvent`]s are
//! broadcast to subscribers such as the WebSocket API.

use atorch_core::{Accessory, AccessoryId, BridgeError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::expiry::Expired;
use crate::platform::{BusEvent, HostPlatform, MessageBus};
use crate::registry::{AccessorySummary, Registry};
use crate::service::ServiceState;

/// Settings consumed by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Hours without discovery traffic before an accessory is reaped
    pub cleanup_hours: f64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self { cleanup_hours: 24.0 }
    }
}

/// Change notifications emitted by the registry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    AccessoryAdded {
        id: AccessoryId,
        name: String,
    },
    AccessoryUpdated {
        id: AccessoryId,
    },
    ServiceAdded {
        accessory: AccessoryId,
        key: String,
        kind: String,
    },
    ServiceRefreshed {
        accessory: AccessoryId,
        key: String,
    },
    ServiceRemoved {
        accessory: AccessoryId,
        key: String,
    },
    ServiceState {
        accessory: AccessoryId,
        key: String,
        state: ServiceState,
        available: bool,
    },
    AccessoryRemoved {
        id: AccessoryId,
    },
    AccessoryExpired {
        id: AccessoryId,
    },
}

/// Cloneable read side of a running bridge
#[derive(Clone)]
pub struct BridgeHandle {
    events: broadcast::Sender<BridgeEvent>,
    view: Arc<RwLock<Vec<AccessorySummary>>>,
}

impl BridgeHandle {
    /// Subscribe to bridge events
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Get current accessory list
    pub async fn accessories(&self) -> Vec<AccessorySummary> {
        self.view.read().await.clone()
    }

    /// Get a specific accessory
    pub async fn accessory(&self, id: &AccessoryId) -> Option<AccessorySummary> {
        self.view.read().await.iter().find(|a| a.id == *id).cloned()
    }
}

pub struct Bridge {
    registry: Registry,
    bus_rx: mpsc::Receiver<BusEvent>,
    expired_rx: mpsc::UnboundedReceiver<Expired>,
    handle: BridgeHandle,
}

impl Bridge {
    pub fn new(
        config: &BridgeConfig,
        host: Arc<dyn HostPlatform>,
        bus: Arc<dyn MessageBus>,
        bus_rx: mpsc::Receiver<BusEvent>,
    ) -> Self {
        let (registry, expired_rx) = Registry::new(host, bus, config);
        let (events, _) = broadcast::channel(100);
        Self {
            registry,
            bus_rx,
            expired_rx,
            handle: BridgeHandle {
                events,
                view: Arc::new(RwLock::new(Vec::new())),
            },
        }
    }

    /// Hand over accessories the host restored from its snapshot. Must run
    /// before the loop starts consuming discovery traffic.
    pub fn restore(&mut self, accessories: impl IntoIterator<Item = Accessory>) {
        for accessory in accessories {
            self.registry.restore(accessory);
        }
    }

    pub fn handle(&self) -> BridgeHandle {
        self.handle.clone()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Process events until the bus channel closes
    pub async fn run(mut self) {
        info!("Bridge started");
        self.publish(Vec::new()).await;

        loop {
            tokio::select! {
                event = self.bus_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        info!("Bus closed, stopping bridge");
                        break;
                    }
                },
                Some(expired) = self.expired_rx.recv() => {
                    let events = self.registry.expire(expired).unwrap_or_else(|e| {
                        log_failure(&e);
                        Vec::new()
                    });
                    self.publish(events).await;
                }
            }
        }
    }

    /// Run a single bus event to completion
    pub async fn handle_event(&mut self, event: BusEvent) {
        let result = match &event {
            BusEvent::Discovered { topic, message } => self.registry.discover(topic, message),
            BusEvent::Removed { topic } => self.registry.remove(topic),
            BusEvent::Message { topic, payload } => {
                Ok(self.registry.handle_message(topic, payload))
            }
        };

        match result {
            Ok(events) => self.publish(events).await,
            Err(e) => {
                log_failure(&e);
                // State may still have changed before the failure
                self.publish(Vec::new()).await;
            }
        }
    }

    async fn publish(&self, events: Vec<BridgeEvent>) {
        *self.handle.view.write().await = self.registry.summaries();
        for event in events {
            debug!(?event, "Bridge event");
            let _ = self.handle.events.send(event);
        }
    }
}

fn log_failure(e: &BridgeError) {
    match e {
        BridgeError::InvalidMessage(_) => warn!(error = %e, "Discovery message skipped"),
        _ => error!(error = %e, "Host platform call failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{HostCall, RecordingBus, RecordingHost};
    use serde_json::json;

    fn bridge(
        cleanup_hours: f64,
    ) -> (Bridge, mpsc::Sender<BusEvent>, Arc<RecordingHost>) {
        let host = Arc::new(RecordingHost::default());
        let bus = Arc::new(RecordingBus::default());
        let (tx, rx) = mpsc::channel(16);
        let bridge = Bridge::new(&BridgeConfig { cleanup_hours }, host.clone(), bus, rx);
        (bridge, tx, host)
    }

    fn discovered(topic: &str, uniq_id: &str, kind: &str) -> BusEvent {
        BusEvent::Discovered {
            topic: topic.to_string(),
            message: json!({
                "name": "DL24 meter",
                "uniq_id": uniq_id,
                "dev": { "ids": ["dev1"] },
                "atorchType": kind,
                "stat_t": format!("atorch/dev1/{uniq_id}")
            }),
        }
    }

    #[tokio::test]
    async fn test_run_processes_bus_events() {
        let (bridge, tx, host) = bridge(24.0);
        let handle = bridge.handle();
        let mut events = handle.subscribe();
        let task = tokio::spawn(bridge.run());

        tx.send(discovered("t1", "a1", "switch")).await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), BridgeEvent::AccessoryAdded { .. }));
        assert!(matches!(events.recv().await.unwrap(), BridgeEvent::ServiceAdded { .. }));

        let view = handle.accessories().await;
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].services.len(), 1);
        assert!(handle.accessory(&AccessoryId::generate("dev1")).await.is_some());

        tx.send(BusEvent::Message {
            topic: "atorch/dev1/a1".to_string(),
            payload: "ON".to_string(),
        })
        .await
        .unwrap();
        assert!(matches!(
            events.recv().await.unwrap(),
            BridgeEvent::ServiceState { state: ServiceState::On, .. }
        ));

        drop(tx);
        task.await.unwrap();
        assert_eq!(host.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_message_does_not_stop_loop() {
        let (bridge, tx, _host) = bridge(24.0);
        let mut events = bridge.handle().subscribe();
        let task = tokio::spawn(bridge.run());

        tx.send(BusEvent::Discovered {
            topic: "bad".to_string(),
            message: json!("not an object"),
        })
        .await
        .unwrap();
        tx.send(BusEvent::Removed { topic: "bad".to_string() }).await.unwrap();
        tx.send(discovered("t1", "a1", "sensor")).await.unwrap();

        assert!(matches!(events.recv().await.unwrap(), BridgeEvent::AccessoryAdded { .. }));

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_runs_through_loop() {
        let (bridge, tx, host) = bridge(0.0);
        let handle = bridge.handle();
        let mut events = handle.subscribe();
        let task = tokio::spawn(bridge.run());

        tx.send(discovered("t1", "a1", "switch")).await.unwrap();
        loop {
            if let BridgeEvent::AccessoryExpired { id } = events.recv().await.unwrap() {
                assert_eq!(id, AccessoryId::generate("dev1"));
                break;
            }
        }
        assert!(handle.accessories().await.is_empty());
        assert_eq!(host.count(|c| matches!(c, HostCall::Unregister(_))), 1);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_restored_accessories_are_visible() {
        let (mut bridge, tx, host) = bridge(24.0);
        let id = AccessoryId::generate("dev9");
        bridge.restore(vec![Accessory::new(id, "Cached")]);
        assert!(bridge.registry().accessory(&id).is_some());

        let handle = bridge.handle();
        drop(tx);
        bridge.run().await;

        let view = handle.accessories().await;
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].display_name, "Cached");
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_event_serialization() {
        let event = BridgeEvent::AccessoryRemoved {
            id: AccessoryId::generate("dev1"),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "accessory_removed");
        assert_eq!(value["id"], json!(AccessoryId::generate("dev1").to_string()));
    }
}
