//! Epoch-stamped cached values
//!
//! A `Cached<T>` holds the most recent value fetched from the ledger together
//! with an epoch counter. The epoch starts at 0, increments exactly once per
//! `update`, and returns to 0 on `clear`. Callers compare epochs to detect a
//! stale read.
//!
//! Mutation happens only on the consumer context (see `dispatch`), so a
//! `Cached<T>` needs no internal locking; the session wraps it in a lock for
//! cross-thread reads.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    value: T,
    epoch: u64,
    last_updated: Option<DateTime<Utc>>,
}

impl<T: Default> Default for Cached<T> {
    fn default() -> Self {
        Self {
            value: T::default(),
            epoch: 0,
            last_updated: None,
        }
    }
}

impl<T: Default> Cached<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the value and advance the epoch.
    pub fn update(&mut self, value: T) {
        self.value = value;
        self.epoch += 1;
        self.last_updated = Some(Utc::now());
    }

    /// Reset to the default value at epoch 0.
    pub fn clear(&mut self) {
        self.value = T::default();
        self.epoch = 0;
        self.last_updated = None;
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// True if the value has been updated since `epoch` was observed.
    pub fn is_newer_than(&self, epoch: u64) -> bool {
        self.epoch > epoch
    }
}
