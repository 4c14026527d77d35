//! Accessory channel opener
//!
//! The accessory gadget function exposes a duplex character device;
//! opening it read/write yields the byte-stream handle the relay engine
//! forwards over.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;

use common::AccessoryDescriptor;
use tether::AccessoryOpener;
use tracing::debug;

pub struct DevNodeOpener {
    path: PathBuf,
}

impl DevNodeOpener {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AccessoryOpener for DevNodeOpener {
    fn open(&mut self, accessory: &AccessoryDescriptor) -> std::io::Result<File> {
        debug!(
            path = %self.path.display(),
            vid = format_args!("{:04x}", accessory.vendor_id),
            pid = format_args!("{:04x}", accessory.product_id),
            "opening accessory channel"
        );
        OpenOptions::new().read(true).write(true).open(&self.path)
    }
}
