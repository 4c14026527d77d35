//! Core tethering session library
//!
//! Everything between the hardware notification and the packet relay: the
//! address policy that turns the accessory serial token into tunnel
//! addressing, the session manager state machine, and the relay forwarding
//! engine. Platform glue (rusb hotplug, TUN device creation, sd-notify)
//! lives in the daemon crate.

pub mod addr;
pub mod engine;
pub mod session;

pub use addr::{AddressConfig, derive};
pub use engine::{EngineFault, ForwardingEngine, RelayEngine};
pub use session::{
    AccessoryOpener, DetachWatcher, ErrorSink, InterfaceProvisioner, ProvisionError, SessionError,
    SessionInfo, SessionManager, SessionState, StatusPublisher, StatusToken, TunInterface,
    WatchToken, WatcherError,
};
