//! ATorch Core - Canonical device model for the ATorch bridge
//!
//! This crate provides the foundational types shared by the bridge:
//! - Message normalization from vendor discovery shapes to canonical keys
//! - Identity derivation for accessories and services
//! - Accessory records and the context bag persisted across restarts
//! - A JSON snapshot file holding every known accessory

pub mod accessory;
pub mod error;
pub mod identity;
pub mod message;
pub mod normalize;
pub mod snapshot;

pub use accessory::{Accessory, AccessoryContext, TimerToken};
pub use error::{BridgeError, Result};
pub use identity::{AccessoryId, Identity};
pub use message::{CanonicalMessage, DeviceBlock, EntityType, RawMessage};
pub use normalize::normalize;
pub use snapshot::{write_atomic, Snapshot, SnapshotEntry, SnapshotError};
