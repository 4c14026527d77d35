//! Async channel bridge between Tokio runtime and the USB watcher thread

use async_channel::{Receiver, Sender, bounded};

use crate::accessory::AccessoryDescriptor;

/// Commands from the Tokio runtime to the USB watcher thread
#[derive(Debug)]
pub enum AccessoryCommand {
    /// List devices currently matching the accessory filters
    ListAccessories {
        /// Channel to send the response back
        response: tokio::sync::oneshot::Sender<Vec<AccessoryDescriptor>>,
    },

    /// Shut the watcher thread down gracefully
    Shutdown,
}

/// Attachment events from the USB watcher thread
#[derive(Debug, Clone)]
pub enum AccessoryEvent {
    /// A tether accessory appeared on the bus
    Attached(AccessoryDescriptor),

    /// A tracked accessory left the bus
    Detached,
}

/// Handle for the Tokio runtime (async)
#[derive(Clone)]
pub struct AccessoryBridge {
    cmd_tx: Sender<AccessoryCommand>,
    event_rx: Receiver<AccessoryEvent>,
}

impl AccessoryBridge {
    /// Send a command to the USB watcher thread
    pub async fn send_command(&self, cmd: AccessoryCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the USB watcher thread
    pub async fn recv_event(&self) -> crate::Result<AccessoryEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the USB watcher thread (blocking)
pub struct AccessoryWorker {
    pub(crate) cmd_rx: Receiver<AccessoryCommand>,
    /// Event sender (public for the hotplug callback to clone)
    pub event_tx: Sender<AccessoryEvent>,
}

impl AccessoryWorker {
    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<AccessoryCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to the Tokio runtime (blocking)
    pub fn send_event(&self, event: AccessoryEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Create the channel bridge between Tokio and the USB watcher thread
///
/// Returns (AccessoryBridge for Tokio, AccessoryWorker for the USB thread).
/// Attachment events are rare, so the channels are small.
pub fn create_accessory_bridge() -> (AccessoryBridge, AccessoryWorker) {
    let (cmd_tx, cmd_rx) = bounded(16);
    let (event_tx, event_rx) = bounded(16);

    (
        AccessoryBridge { cmd_tx, event_rx },
        AccessoryWorker { cmd_rx, event_tx },
    )
}
