//! ATorch MQTT - Bus client for the bridge
//!
//! Connects to an MQTT broker, classifies publishes into bus events and
//! manages the status topic subscriptions requested by services.

pub mod client;
pub mod error;
pub mod topic;

pub use client::{MqttBus, MqttConfig, MqttEventLoop};
pub use error::MqttError;
pub use topic::classify;
