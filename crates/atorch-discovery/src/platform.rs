//! Collaborator seams: the host platform and the message bus

use atorch_core::{Accessory, AccessoryId, RawMessage, Result};
use serde::Serialize;

/// Platform that exposes accessories to the outside world and persists
/// their context between runs
pub trait HostPlatform: Send + Sync {
    fn register_accessories(&self, accessories: &[&Accessory]) -> Result<()>;

    fn unregister_accessories(&self, accessories: &[&Accessory]) -> Result<()>;

    fn update_accessories(&self, accessories: &[&Accessory]) -> Result<()>;

    /// Deterministic accessory id for a device identifier
    fn generate_id(&self, seed: &str) -> AccessoryId {
        AccessoryId::generate(seed)
    }
}

/// Handle returned by [`MessageBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SubscriptionHandle(pub u64);

/// Topic subscriptions on the message bus.
///
/// Calls must not block; the bridge invokes them from inside an event
/// handler.
pub trait MessageBus: Send + Sync {
    fn subscribe(&self, topic: &str) -> SubscriptionHandle;

    fn unsubscribe(&self, handle: SubscriptionHandle);
}

/// Events delivered by the bus client
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    /// A discovery descriptor was published
    Discovered { topic: String, message: RawMessage },
    /// A discovery descriptor was withdrawn
    Removed { topic: String },
    /// Payload on a topic some service subscribed to
    Message { topic: String, payload: String },
}
