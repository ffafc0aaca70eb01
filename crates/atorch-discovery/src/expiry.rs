//! Per-accessory expiry timers
//!
//! Every accessory owns at most one armed timer. Its token lives in the
//! accessory context; the scheduler keeps the abort handle for each token.
//! A fired timer does not touch the registry directly, it posts an
//! [`Expired`] notice into the bridge inbox so the reap runs as an ordinary
//! event between other handlers.

use atorch_core::{Accessory, AccessoryId, TimerToken};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::trace;

/// Notice that an accessory's timer ran out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub accessory: AccessoryId,
    pub token: TimerToken,
}

pub struct ExpiryScheduler {
    window: Duration,
    tx: mpsc::UnboundedSender<Expired>,
    timers: HashMap<TimerToken, (AccessoryId, AbortHandle)>,
    next_token: u64,
}

impl ExpiryScheduler {
    pub fn new(window: Duration, tx: mpsc::UnboundedSender<Expired>) -> Self {
        Self {
            window,
            tx,
            timers: HashMap::new(),
            next_token: 1,
        }
    }

    /// Window given in hours, as configured. Negative or NaN values mean
    /// immediate expiry; windows too long to represent saturate.
    pub fn from_hours(hours: f64, tx: mpsc::UnboundedSender<Expired>) -> Self {
        let window = if hours.is_nan() || hours <= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(hours * 3600.0).unwrap_or(Duration::MAX)
        };
        Self::new(window, tx)
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Cancel the accessory's current timer and arm a fresh one
    pub fn reset(&mut self, accessory: &mut Accessory) {
        self.cancel(accessory);

        let token = TimerToken(self.next_token);
        self.next_token += 1;

        let tx = self.tx.clone();
        let window = self.window;
        let expired = Expired {
            accessory: accessory.id,
            token,
        };
        let task = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = tx.send(expired);
        });

        self.timers.insert(token, (accessory.id, task.abort_handle()));
        accessory.context.timeout = Some(token);
        trace!(accessory = %accessory.id, token = token.0, "Expiry armed");
    }

    /// Cancel the accessory's timer, if it owns one
    pub fn cancel(&mut self, accessory: &mut Accessory) {
        let Some(token) = accessory.context.timeout.take() else {
            return;
        };
        // Tokens restored from a snapshot may name timers of a previous run
        if matches!(self.timers.get(&token), Some((owner, _)) if *owner == accessory.id) {
            if let Some((_, handle)) = self.timers.remove(&token) {
                handle.abort();
            }
        }
    }

    /// Retire a fired token. Returns false when the token was cancelled
    /// after the notice was queued.
    pub fn fired(&mut self, token: TimerToken) -> bool {
        self.timers.remove(&token).is_some()
    }

    /// Number of armed timers
    pub fn active(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.timers.values() {
            handle.abort();
        }
    }
}
