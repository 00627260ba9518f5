//! Last-known venue time
//!
//! Advanced by max-merge from tick epochs and `time` replies, so it never
//! moves backwards even when replies arrive out of wall-clock order.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Snapshot of the venue clock as seen by this client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerTime {
    pub last_epoch: i64,
    /// Set once a `time` reply has been received.
    pub known: bool,
}

#[derive(Debug, Default)]
pub struct TimeSync {
    inner: Mutex<ServerTime>,
}

impl TimeSync {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerTime> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Max-merge an observed epoch without touching `known`.
    pub fn advance(&self, epoch: i64) -> i64 {
        let mut t = self.lock();
        t.last_epoch = t.last_epoch.max(epoch);
        t.last_epoch
    }

    /// Max-merge an authoritative `time` reply and mark the clock known.
    pub fn record_server_time(&self, epoch: i64) -> i64 {
        let mut t = self.lock();
        t.last_epoch = t.last_epoch.max(epoch);
        t.known = true;
        t.last_epoch
    }

    pub fn snapshot(&self) -> ServerTime {
        *self.lock()
    }
}
