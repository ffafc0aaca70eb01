//! In-memory collaborators for unit tests

use atorch_core::{Accessory, AccessoryId, BridgeError, Result};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::platform::{HostPlatform, MessageBus, SubscriptionHandle};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    Register(Vec<AccessoryId>),
    Unregister(Vec<AccessoryId>),
    Update(Vec<AccessoryId>),
}

/// Host platform that records every call
#[derive(Debug, Default)]
pub struct RecordingHost {
    calls: Mutex<Vec<HostCall>>,
    fail: AtomicBool,
}

impl RecordingHost {
    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    /// Make every following call return a host error
    pub fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn count(&self, matches: impl Fn(&HostCall) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    fn record(&self, call: HostCall) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail.load(Ordering::SeqCst) {
            return Err(BridgeError::Host("injected failure".to_string()));
        }
        Ok(())
    }
}

fn ids(accessories: &[&Accessory]) -> Vec<AccessoryId> {
    accessories.iter().map(|a| a.id).collect()
}

impl HostPlatform for RecordingHost {
    fn register_accessories(&self, accessories: &[&Accessory]) -> Result<()> {
        self.record(HostCall::Register(ids(accessories)))
    }

    fn unregister_accessories(&self, accessories: &[&Accessory]) -> Result<()> {
        self.record(HostCall::Unregister(ids(accessories)))
    }

    fn update_accessories(&self, accessories: &[&Accessory]) -> Result<()> {
        self.record(HostCall::Update(ids(accessories)))
    }
}

/// Message bus that tracks which subscriptions are open
#[derive(Debug, Default)]
pub struct RecordingBus {
    next: AtomicU64,
    subscribes: AtomicU64,
    active: Mutex<BTreeMap<u64, String>>,
}

impl RecordingBus {
    /// Topics with an open subscription, sorted
    pub fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.active.lock().unwrap().values().cloned().collect();
        topics.sort();
        topics
    }

    pub fn subscribe_calls(&self) -> u64 {
        self.subscribes.load(Ordering::SeqCst)
    }
}

impl MessageBus for RecordingBus {
    fn subscribe(&self, topic: &str) -> SubscriptionHandle {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        let handle = self.next.fetch_add(1, Ordering::SeqCst);
        self.active.lock().unwrap().insert(handle, topic.to_string());
        SubscriptionHandle(handle)
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.active.lock().unwrap().remove(&handle.0);
    }
}
