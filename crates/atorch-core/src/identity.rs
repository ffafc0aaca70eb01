//! Accessory and service identity derivation

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::message::CanonicalMessage;

/// Stable accessory identifier, content-addressed from a device identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessoryId(pub Uuid);

impl AccessoryId {
    /// Derive the id for a device identifier; the same seed always yields
    /// the same id
    pub fn generate(seed: &str) -> Self {
        Self(Uuid::new_v5(&Uuid::NAMESPACE_OID, seed.as_bytes()))
    }

    pub fn parse(value: &str) -> Option<Self> {
        Uuid::parse_str(value).ok().map(Self)
    }
}

impl std::fmt::Display for AccessoryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a discovery message lands in the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub accessory_id: AccessoryId,
    /// Service key, taken verbatim from `uniq_id`
    pub service_key: String,
}

impl Identity {
    /// Derive identity using [`AccessoryId::generate`]
    pub fn from_message(message: &CanonicalMessage) -> Result<Self> {
        Self::derive(message, AccessoryId::generate)
    }

    /// Derive identity with a caller-supplied id generator
    pub fn derive<F>(message: &CanonicalMessage, generate: F) -> Result<Self>
    where
        F: FnOnce(&str) -> AccessoryId,
    {
        let service_key = message
            .unique_id
            .clone()
            .ok_or_else(|| BridgeError::InvalidMessage("missing uniq_id".to_string()))?;
        let seed = message
            .device_identifiers()
            .first()
            .ok_or_else(|| BridgeError::InvalidMessage("missing dev.ids".to_string()))?;

        Ok(Self {
            accessory_id: generate(seed),
            service_key,
        })
    }
}
