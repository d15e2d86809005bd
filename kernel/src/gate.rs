//! Dispatcher wake gate
//!
//! A single-permit signal meaning "a scheduling decision may be pending".
//! Any number of [`WakeGate::wake`] calls made while the dispatcher is busy
//! collapse into one stored permit, and a wake is never lost: the permit
//! survives until the dispatcher next waits. The dispatcher re-reads the
//! scheduler state after every wake, so coalescing is harmless.

use tokio::sync::Notify;

/// Capacity-1 coalescing wake signal
#[derive(Debug)]
pub struct WakeGate {
    notify: Notify,
}

impl WakeGate {
    /// Create a gate that starts with its permit available
    pub fn new() -> Self {
        let notify = Notify::new();
        notify.notify_one();
        Self { notify }
    }

    /// Post a wake; never blocks
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    /// Wait for the permit and consume it
    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

impl Default for WakeGate {
    fn default() -> Self {
        Self::new()
    }
}
