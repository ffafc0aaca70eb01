//! rumqttc backed bus client

use atorch_discovery::{BusEvent, MessageBus, SubscriptionHandle};
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::MqttError;
use crate::topic::classify;

/// Broker connection settings
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Filter the discovery descriptors are published under
    pub discovery_topic: String,
    /// Prefix of the client id; a random suffix is appended on connect
    pub client_id: String,
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            discovery_topic: "homeassistant/#".to_string(),
            client_id: "atorch-bridge".to_string(),
            keep_alive: Duration::from_secs(60),
        }
    }
}

impl MqttConfig {
    fn options(&self) -> MqttOptions {
        let suffix = Uuid::new_v4().simple().to_string();
        let client_id = format!("{}-{}", self.client_id, &suffix[..8]);

        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            options.set_credentials(user, pass);
        }
        options
    }
}

/// Reference counted topic subscriptions. Several services may listen on
/// the same status topic; the broker subscription lives until the last
/// handle is released.
///
/// Topics whose subscribe request could not be queued on the client are
/// kept in `pending` until the event loop replays them.
#[derive(Debug, Default)]
struct Subscriptions {
    next: u64,
    handles: HashMap<u64, String>,
    counts: HashMap<String, usize>,
    pending: HashSet<String>,
}

impl Subscriptions {
    /// Returns the new handle and whether the topic was not yet subscribed
    fn add(&mut self, topic: &str) -> (SubscriptionHandle, bool) {
        let handle = self.next;
        self.next += 1;
        self.handles.insert(handle, topic.to_string());
        let count = self.counts.entry(topic.to_string()).or_insert(0);
        *count += 1;
        (SubscriptionHandle(handle), *count == 1)
    }

    /// Returns the topic to unsubscribe when its last handle was released.
    /// A topic still waiting for its subscribe request needs no unsubscribe.
    fn release(&mut self, handle: SubscriptionHandle) -> Option<String> {
        let topic = self.handles.remove(&handle.0)?;
        let count = self.counts.get_mut(&topic)?;
        *count -= 1;
        if *count > 0 {
            return None;
        }
        self.counts.remove(&topic);
        if self.pending.remove(&topic) {
            return None;
        }
        Some(topic)
    }

    /// Queue a held topic whose subscribe request was not sent
    fn defer(&mut self, topic: &str) {
        if self.counts.contains_key(topic) {
            self.pending.insert(topic.to_string());
        }
    }

    fn take_pending(&mut self) -> Vec<String> {
        self.pending.drain().collect()
    }

    fn topics(&self) -> Vec<String> {
        self.counts.keys().cloned().collect()
    }
}

fn lock(subscriptions: &Mutex<Subscriptions>) -> MutexGuard<'_, Subscriptions> {
    subscriptions.lock().unwrap_or_else(|e| e.into_inner())
}

/// Subscription side of the MQTT connection
#[derive(Clone)]
pub struct MqttBus {
    client: AsyncClient,
    subscriptions: Arc<Mutex<Subscriptions>>,
}

impl MqttBus {
    /// Create the client. Nothing happens on the wire until
    /// [`MqttEventLoop::run`] is polled.
    pub fn connect(config: &MqttConfig) -> (Self, MqttEventLoop) {
        let (client, eventloop) = AsyncClient::new(config.options(), 64);
        // The discovery filter is held for the lifetime of the connection
        let mut held = Subscriptions::default();
        held.add(&config.discovery_topic);
        let subscriptions = Arc::new(Mutex::new(held));

        let bus = Self {
            client: client.clone(),
            subscriptions: subscriptions.clone(),
        };
        let eventloop = MqttEventLoop {
            eventloop,
            client,
            subscriptions,
            broker: format!("{}:{}", config.host, config.port),
        };
        (bus, eventloop)
    }

    fn request_subscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client.try_subscribe(topic, QoS::AtMostOnce)?;
        Ok(())
    }

    fn request_unsubscribe(&self, topic: &str) -> Result<(), MqttError> {
        self.client.try_unsubscribe(topic)?;
        Ok(())
    }
}

impl MessageBus for MqttBus {
    fn subscribe(&self, topic: &str) -> SubscriptionHandle {
        let (handle, first) = lock(&self.subscriptions).add(topic);
        if first {
            debug!(topic, "Subscribing");
            if let Err(e) = self.request_subscribe(topic) {
                debug!(topic, error = %e, "Subscribe request deferred");
                lock(&self.subscriptions).defer(topic);
            }
        }
        handle
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        let released = lock(&self.subscriptions).release(handle);
        if let Some(topic) = released {
            debug!(topic = %topic, "Unsubscribing");
            if let Err(e) = self.request_unsubscribe(&topic) {
                warn!(topic = %topic, error = %e, "Unsubscribe request failed");
            }
        }
    }
}

/// Connection driver, forwards classified publishes to the bridge
pub struct MqttEventLoop {
    eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<Mutex<Subscriptions>>,
    broker: String,
}

impl MqttEventLoop {
    /// Poll the connection until the bridge inbox closes. Connection errors
    /// are retried after a second.
    pub async fn run(mut self, tx: mpsc::Sender<BusEvent>) {
        info!(broker = %self.broker, "Connecting to MQTT broker");

        loop {
            self.flush_pending();
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(broker = %self.broker, "Connected to MQTT broker");
                    self.resubscribe();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let Some(event) = classify(&publish.topic, &publish.payload) else {
                        continue;
                    };
                    if tx.send(event).await.is_err() {
                        info!("Bridge stopped, closing MQTT loop");
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(broker = %self.broker, error = %e, "MQTT connection error");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Subscribe the discovery filter and every topic services hold
    fn resubscribe(&self) {
        let topics = {
            let mut subscriptions = lock(&self.subscriptions);
            subscriptions.pending.clear();
            subscriptions.topics()
        };
        self.request(topics);
    }

    /// Replay subscribe requests that found the client queue full
    fn flush_pending(&self) {
        let topics = lock(&self.subscriptions).take_pending();
        if !topics.is_empty() {
            debug!(count = topics.len(), "Replaying deferred subscriptions");
            self.request(topics);
        }
    }

    fn request(&self, topics: Vec<String>) {
        for topic in topics {
            if let Err(e) = self.client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                debug!(topic = %topic, error = %e, "Subscribe request deferred");
                lock(&self.subscriptions).defer(&topic);
            }
        }
    }
}
