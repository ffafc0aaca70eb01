//! Capability services attached to accessories
//!
//! Each entity kind has its own capability type. A [`Service`] wraps the
//! capability together with its bus subscriptions and availability, and
//! provides the lifecycle used by the registry: create, refresh, teardown.

use atorch_core::{AccessoryId, CanonicalMessage, EntityType};
use serde::Serialize;
use serde_json::Value;
use std::borrow::Cow;
use std::fmt;
use tracing::{debug, trace};

use crate::platform::{MessageBus, SubscriptionHandle};

const DEFAULT_PAYLOAD_ON: &str = "ON";
const DEFAULT_PAYLOAD_OFF: &str = "OFF";
const DEFAULT_PAYLOAD_AVAILABLE: &str = "online";
const DEFAULT_PAYLOAD_NOT_AVAILABLE: &str = "offline";

/// Last state reported on a service's status topic
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ServiceState {
    Unknown,
    On,
    Off,
    Light { on: bool, brightness: Option<u8> },
    Reading(String),
}

/// Behaviour specific to one entity kind
pub trait Capability: fmt::Debug + Send + Sync {
    fn kind(&self) -> EntityType;

    /// Adopt the payload vocabulary of a (re)discovered message
    fn configure(&mut self, message: &CanonicalMessage);

    /// Apply a status payload, returns true when the state changed
    fn apply_state(&mut self, payload: &str) -> bool;

    fn state(&self) -> ServiceState;
}

/// Build the capability for a message, `None` for unrecognized kinds
pub fn build_capability(message: &CanonicalMessage) -> Option<Box<dyn Capability>> {
    let capability: Box<dyn Capability> = match message.kind() {
        EntityType::Switch => Box::new(Switch::new(message)),
        EntityType::Light => Box::new(Light::new(message)),
        EntityType::Sensor => Box::new(Sensor::new(message)),
        EntityType::BinarySensor => Box::new(BinarySensor::new(message)),
        EntityType::Unrecognized(_) => return None,
    };
    Some(capability)
}

/// `pl_on` / `pl_off` vocabulary
#[derive(Debug, Clone)]
struct OnOffPayloads {
    on: String,
    off: String,
}

impl OnOffPayloads {
    fn from_message(message: &CanonicalMessage) -> Self {
        Self {
            on: message
                .payload_on
                .clone()
                .unwrap_or_else(|| DEFAULT_PAYLOAD_ON.to_string()),
            off: message
                .payload_off
                .clone()
                .unwrap_or_else(|| DEFAULT_PAYLOAD_OFF.to_string()),
        }
    }

    fn parse(&self, value: &str) -> Option<bool> {
        let value = value.trim();
        if value == self.on {
            Some(true)
        } else if value == self.off {
            Some(false)
        } else {
            None
        }
    }
}

/// Pull the power value out of a status payload. Tasmota style telemetry
/// carries it inside a JSON object, plain firmwares publish it bare.
fn power_value(payload: &str) -> Cow<'_, str> {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(payload) {
        for key in ["POWER", "state", "STATE"] {
            if let Some(Value::String(value)) = map.get(key) {
                return Cow::Owned(value.clone());
            }
        }
    }
    Cow::Borrowed(payload)
}

fn on_off_state(state: Option<bool>) -> ServiceState {
    match state {
        Some(true) => ServiceState::On,
        Some(false) => ServiceState::Off,
        None => ServiceState::Unknown,
    }
}

#[derive(Debug)]
pub struct Switch {
    payloads: OnOffPayloads,
    on: Option<bool>,
}

impl Switch {
    pub fn new(message: &CanonicalMessage) -> Self {
        Self {
            payloads: OnOffPayloads::from_message(message),
            on: None,
        }
    }
}

impl Capability for Switch {
    fn kind(&self) -> EntityType {
        EntityType::Switch
    }

    fn configure(&mut self, message: &CanonicalMessage) {
        self.payloads = OnOffPayloads::from_message(message);
    }

    fn apply_state(&mut self, payload: &str) -> bool {
        match self.payloads.parse(&power_value(payload)) {
            Some(on) => {
                let changed = self.on != Some(on);
                self.on = Some(on);
                changed
            }
            None => {
                trace!(payload, "Ignoring switch payload");
                false
            }
        }
    }

    fn state(&self) -> ServiceState {
        on_off_state(self.on)
    }
}

#[derive(Debug)]
pub struct Light {
    payloads: OnOffPayloads,
    on: Option<bool>,
    brightness: Option<u8>,
}

impl Light {
    pub fn new(message: &CanonicalMessage) -> Self {
        Self {
            payloads: OnOffPayloads::from_message(message),
            on: None,
            brightness: None,
        }
    }
}

impl Capability for Light {
    fn kind(&self) -> EntityType {
        EntityType::Light
    }

    fn configure(&mut self, message: &CanonicalMessage) {
        self.payloads = OnOffPayloads::from_message(message);
    }

    fn apply_state(&mut self, payload: &str) -> bool {
        let before = (self.on, self.brightness);

        if let Some(on) = self.payloads.parse(&power_value(payload)) {
            self.on = Some(on);
        }
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(payload) {
            let level = ["brightness", "Dimmer"]
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_u64));
            if let Some(level) = level {
                self.brightness = Some(level.min(100) as u8);
            }
        }

        before != (self.on, self.brightness)
    }

    fn state(&self) -> ServiceState {
        match self.on {
            Some(on) => ServiceState::Light {
                on,
                brightness: self.brightness,
            },
            None => ServiceState::Unknown,
        }
    }
}

/// Sensors keep the raw reading
#[derive(Debug)]
pub struct Sensor {
    reading: Option<String>,
}

impl Sensor {
    pub fn new(_message: &CanonicalMessage) -> Self {
        Self { reading: None }
    }
}

impl Capability for Sensor {
    fn kind(&self) -> EntityType {
        EntityType::Sensor
    }

    fn configure(&mut self, _message: &CanonicalMessage) {}

    fn apply_state(&mut self, payload: &str) -> bool {
        let reading = payload.trim();
        if self.reading.as_deref() == Some(reading) {
            return false;
        }
        self.reading = Some(reading.to_string());
        true
    }

    fn state(&self) -> ServiceState {
        match &self.reading {
            Some(reading) => ServiceState::Reading(reading.clone()),
            None => ServiceState::Unknown,
        }
    }
}

#[derive(Debug)]
pub struct BinarySensor {
    payloads: OnOffPayloads,
    detected: Option<bool>,
}

impl BinarySensor {
    pub fn new(message: &CanonicalMessage) -> Self {
        Self {
            payloads: OnOffPayloads::from_message(message),
            detected: None,
        }
    }
}

impl Capability for BinarySensor {
    fn kind(&self) -> EntityType {
        EntityType::BinarySensor
    }

    fn configure(&mut self, message: &CanonicalMessage) {
        self.payloads = OnOffPayloads::from_message(message);
    }

    fn apply_state(&mut self, payload: &str) -> bool {
        match self.payloads.parse(&power_value(payload)) {
            Some(detected) => {
                let changed = self.detected != Some(detected);
                self.detected = Some(detected);
                changed
            }
            None => false,
        }
    }

    fn state(&self) -> ServiceState {
        on_off_state(self.detected)
    }
}

#[derive(Debug)]
struct Subscription {
    topic: String,
    handle: SubscriptionHandle,
}

impl Subscription {
    fn open(bus: &dyn MessageBus, topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            handle: bus.subscribe(topic),
        }
    }

    fn close(self, bus: &dyn MessageBus) {
        bus.unsubscribe(self.handle);
    }
}

/// Keep an existing subscription when the topic is unchanged, otherwise
/// swap it for one on the wanted topic
fn resubscribe(
    bus: &dyn MessageBus,
    current: Option<Subscription>,
    wanted: Option<&str>,
) -> Option<Subscription> {
    match (current, wanted) {
        (Some(sub), Some(topic)) if sub.topic == topic => Some(sub),
        (current, wanted) => {
            if let Some(sub) = current {
                sub.close(bus);
            }
            wanted.map(|topic| Subscription::open(bus, topic))
        }
    }
}

/// One capability of an accessory
#[derive(Debug)]
pub struct Service {
    key: String,
    name: String,
    accessory: AccessoryId,
    capability: Box<dyn Capability>,
    status: Option<Subscription>,
    availability: Option<Subscription>,
    availability_payloads: (String, String),
    available: bool,
}

impl Service {
    /// Construct the service for a message and subscribe to its topics.
    /// Returns `None` when the entity kind is not recognized.
    pub fn create(
        bus: &dyn MessageBus,
        accessory: AccessoryId,
        key: &str,
        message: &CanonicalMessage,
    ) -> Option<Self> {
        let capability = build_capability(message)?;
        let mut service = Self {
            key: key.to_string(),
            name: message.display_name(),
            accessory,
            capability,
            status: None,
            availability: None,
            availability_payloads: availability_payloads(message),
            available: true,
        };
        service.subscribe(bus, message);
        debug!(service = %service.key, kind = %service.kind(), "Service created");
        Some(service)
    }

    /// Bring an existing service up to date with a rediscovered message
    /// without tearing it down
    pub fn refresh(&mut self, bus: &dyn MessageBus, message: &CanonicalMessage) {
        self.name = message.display_name();
        self.availability_payloads = availability_payloads(message);

        let kind = message.kind();
        if kind.is_recognized() && kind != self.capability.kind() {
            if let Some(capability) = build_capability(message) {
                debug!(service = %self.key, from = %self.capability.kind(), to = %kind, "Service kind changed");
                self.capability = capability;
            }
        } else {
            self.capability.configure(message);
        }

        self.subscribe(bus, message);
    }

    /// Release the bus subscriptions held by this service
    pub fn teardown(self, bus: &dyn MessageBus) {
        if let Some(sub) = self.status {
            sub.close(bus);
        }
        if let Some(sub) = self.availability {
            sub.close(bus);
        }
        debug!(service = %self.key, "Service torn down");
    }

    fn subscribe(&mut self, bus: &dyn MessageBus, message: &CanonicalMessage) {
        self.status = resubscribe(bus, self.status.take(), message.state_topic.as_deref());
        self.availability = resubscribe(
            bus,
            self.availability.take(),
            message.availability_topic.as_deref(),
        );
    }

    pub fn listens_to(&self, topic: &str) -> bool {
        self.status.as_ref().is_some_and(|s| s.topic == topic)
            || self.availability.as_ref().is_some_and(|s| s.topic == topic)
    }

    /// Apply a bus message, returns the new state when anything changed
    pub fn handle_message(&mut self, topic: &str, payload: &str) -> Option<ServiceState> {
        let mut changed = false;

        if self.availability.as_ref().is_some_and(|s| s.topic == topic) {
            let (available, not_available) = &self.availability_payloads;
            let value = payload.trim();
            let parsed = if value.eq_ignore_ascii_case(available) {
                Some(true)
            } else if value.eq_ignore_ascii_case(not_available) {
                Some(false)
            } else {
                None
            };
            if let Some(parsed) = parsed {
                changed |= parsed != self.available;
                self.available = parsed;
            }
        }

        if self.status.as_ref().is_some_and(|s| s.topic == topic) {
            changed |= self.capability.apply_state(payload);
        }

        changed.then(|| self.capability.state())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn accessory_id(&self) -> AccessoryId {
        self.accessory
    }

    pub fn kind(&self) -> EntityType {
        self.capability.kind()
    }

    pub fn state(&self) -> ServiceState {
        self.capability.state()
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    pub fn status_topic(&self) -> Option<&str> {
        self.status.as_ref().map(|s| s.topic.as_str())
    }
}

fn availability_payloads(message: &CanonicalMessage) -> (String, String) {
    (
        message
            .payload_available
            .clone()
            .unwrap_or_else(|| DEFAULT_PAYLOAD_AVAILABLE.to_string()),
        message
            .payload_not_available
            .clone()
            .unwrap_or_else(|| DEFAULT_PAYLOAD_NOT_AVAILABLE.to_string()),
    )
}
