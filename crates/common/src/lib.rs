//! Common utilities for usb-tether
//!
//! This crate provides functionality shared between the core tether library
//! and the daemon: the error type, logging setup, the accessory descriptor,
//! and the async channel bridge for USB watcher thread communication.

pub mod accessory;
pub mod channel;
pub mod error;
pub mod logging;

pub use accessory::AccessoryDescriptor;
pub use channel::{
    AccessoryBridge, AccessoryCommand, AccessoryEvent, AccessoryWorker, create_accessory_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
