//! # Latest-Value Channel
//!
//! Single-slot hand-off between the receive and forward threads. Publishing
//! overwrites whatever the consumer has not read yet; only the newest
//! measurement is meaningful, and queueing stale ones would add forwarding
//! lag.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub struct LatestSlot<T> {
    value: Mutex<Option<T>>,
    ready: Condvar,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Stores `value`, discarding any unread one. Never blocks on the
    /// consumer and cannot fail.
    ///
    /// Returns `true` if an unread value was overwritten.
    pub fn publish(&self, value: T) -> bool {
        let replaced = {
            let mut slot = self.value.lock().unwrap_or_else(|e| e.into_inner());
            slot.replace(value).is_some()
        };
        self.ready.notify_one();
        replaced
    }

    /// Waits up to `timeout` for a value, takes it and clears the slot.
    pub fn consume(&self, timeout: Duration) -> Option<T> {
        let slot = self.value.lock().unwrap_or_else(|e| e.into_inner());
        let (mut slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |v| v.is_none())
            .unwrap_or_else(|e| e.into_inner());
        slot.take()
    }

    /// Takes the current value without waiting.
    pub fn try_consume(&self) -> Option<T> {
        self.value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}
