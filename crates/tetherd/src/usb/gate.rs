//! Detach delivery gate
//!
//! The hotplug watcher reports every accessory departure; only a running
//! session should receive them. The gate is the daemon-side implementation
//! of the session manager's detach subscription: armed on register,
//! disarmed on unregister, consulted by the event pump before forwarding a
//! detach.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tether::{DetachWatcher, WatchToken, WatcherError};
use tracing::debug;

#[derive(Clone)]
pub struct DetachGate {
    armed: Arc<AtomicBool>,
    next_token: Arc<AtomicU64>,
}

impl DetachGate {
    pub fn new() -> Self {
        Self {
            armed: Arc::new(AtomicBool::new(false)),
            next_token: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Whether a session currently subscribes to detach notifications
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }
}

impl Default for DetachGate {
    fn default() -> Self {
        Self::new()
    }
}

impl DetachWatcher for DetachGate {
    fn register(&mut self) -> Result<WatchToken, WatcherError> {
        self.armed.store(true, Ordering::SeqCst);
        let token = WatchToken(self.next_token.fetch_add(1, Ordering::SeqCst));
        debug!(?token, "detach subscription armed");
        Ok(token)
    }

    fn unregister(&mut self, token: WatchToken) {
        self.armed.store(false, Ordering::SeqCst);
        debug!(?token, "detach subscription disarmed");
    }
}
