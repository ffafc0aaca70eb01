//! Application state management

use anyhow::Result;
use atorch_core::AccessoryId;
use atorch_discovery::{AccessorySummary, Bridge, BridgeEvent, BridgeHandle};
use atorch_mqtt::MqttBus;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

use crate::config::Config;
use crate::host::SnapshotHost;

/// Shared application state
pub struct AppState {
    /// Read side of the running bridge
    pub bridge: BridgeHandle,
    /// Configuration
    pub config: Config,
}

impl AppState {
    /// Restore the snapshot, connect to the broker and start the bridge
    pub async fn new(config: Config) -> Result<Arc<Self>> {
        let (host, writer) = SnapshotHost::open(&config.bridge.snapshot)?;
        let host = Arc::new(host);
        tokio::spawn(writer.run());
        let (bus, eventloop) = MqttBus::connect(&config.to_mqtt_config());
        let (tx, rx) = mpsc::channel(256);

        let mut bridge = Bridge::new(&config.to_bridge_config(), host.clone(), Arc::new(bus), rx);

        // Cached accessories go in before any discovery traffic is consumed
        let restored = host.restored();
        info!(count = restored.len(), "Restoring accessories from cache");
        bridge.restore(restored);

        let handle = bridge.handle();
        tokio::spawn(eventloop.run(tx));
        tokio::spawn(bridge.run());

        Ok(Arc::new(Self {
            bridge: handle,
            config,
        }))
    }

    pub async fn accessories(&self) -> Vec<AccessorySummary> {
        self.bridge.accessories().await
    }

    pub async fn get_accessory(&self, id: &AccessoryId) -> Option<AccessorySummary> {
        self.bridge.accessory(id).await
    }

    /// Subscribe to bridge events
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.bridge.subscribe()
    }
}
