//! ATorch Discovery - Reconciles discovery traffic into accessories
//!
//! This crate owns the long-lived state of the bridge:
//! - Discovery topic map routing removals back to registry entries
//! - Capability services (switch, light, sensor, binary sensor)
//! - The accessory/service registry with create, refresh and remove
//! - Per-accessory expiry timers
//! - The bridge event loop processing bus events one at a time

pub mod bridge;
pub mod expiry;
pub mod platform;
pub mod registry;
pub mod service;
pub mod topic_map;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{Bridge, BridgeConfig, BridgeEvent, BridgeHandle};
pub use expiry::{Expired, ExpiryScheduler};
pub use platform::{BusEvent, HostPlatform, MessageBus, SubscriptionHandle};
pub use registry::{AccessorySummary, Registry, ServiceSummary};
pub use service::{Capability, Service, ServiceState};
pub use topic_map::{DiscoveryTopicMap, EntityKind, TopicEntry};
