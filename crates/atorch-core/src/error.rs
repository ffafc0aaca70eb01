//! Error taxonomy shared by the bridge crates

use thiserror::Error;

/// Everything that can go wrong while reconciling discovery traffic.
///
/// Only `InvalidMessage` and `Host` are ever returned as errors by the
/// registry. The remaining variants describe conditions that are logged and
/// absorbed, so they show up as the `error` field of log records.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BridgeError {
    #[error("Invalid discovery message: {0}")]
    InvalidMessage(String),
    #[error("Unhandled ATorch device type: {0}")]
    UnknownEntityType(String),
    #[error("{name} has an incorrectly configured MQTT topic {topic}, please make it unique")]
    MisconfiguredTopic { name: String, topic: String },
    #[error("Removal for untracked {0}")]
    OrphanRemoval(String),
    #[error("Host platform error: {0}")]
    Host(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
