//! USB accessory watcher
//!
//! A dedicated thread owns the rusb context, registers a hotplug callback
//! filtered to the configured accessory VID:PID patterns, and converts
//! arrivals and departures into `AccessoryEvent`s for the session manager.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{AccessoryCommand, AccessoryDescriptor, AccessoryEvent, AccessoryWorker};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use tracing::{debug, info, warn};

/// USB accessory watcher
///
/// Runs the libusb event loop and processes commands from the Tokio
/// runtime until a Shutdown command arrives.
struct AccessoryWatcher {
    context: Context,
    worker: AccessoryWorker,
    filters: Vec<String>,
    /// Hot-plug registration, kept alive for the watcher's lifetime
    _hotplug: Option<Registration<Context>>,
}

impl AccessoryWatcher {
    fn new(worker: AccessoryWorker, filters: Vec<String>) -> Result<Self, rusb::Error> {
        let context = Context::new()?;

        Ok(Self {
            context,
            worker,
            filters,
            _hotplug: None,
        })
    }

    fn initialize(&mut self) -> Result<(), rusb::Error> {
        let callback = AccessoryHotplug {
            event_tx: self.worker.event_tx.clone(),
            filters: self.filters.clone(),
            present: Arc::new(Mutex::new(HashSet::new())),
        };

        // enumerate(true) replays already-attached devices through the
        // callback, so an accessory plugged in before the daemon started
        // still opens a session
        let registration = HotplugBuilder::new()
            .enumerate(true)
            .register(&self.context, Box::new(callback))?;

        self._hotplug = Some(registration);
        info!("accessory watcher initialized");
        Ok(())
    }

    /// Run the watcher event loop
    ///
    /// Alternates between a non-blocking command poll and libusb event
    /// handling with a timeout, so shutdown requests are noticed promptly.
    fn run(mut self) -> Result<(), rusb::Error> {
        info!("usb watcher thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(AccessoryCommand::Shutdown) => {
                    info!("usb watcher shutting down");
                    break;
                }
                Some(AccessoryCommand::ListAccessories { response }) => {
                    let _ = response.send(self.list_accessories());
                }
                None => {}
            }

            let timeout = Duration::from_millis(100);
            match self.context.handle_events(Some(timeout)) {
                Ok(()) => {}
                Err(rusb::Error::Interrupted) => {
                    debug!("usb event handling interrupted");
                }
                Err(e) => {
                    warn!("error handling usb events: {}", e);
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }

        info!("usb watcher thread stopped");
        Ok(())
    }

    /// Enumerate devices currently matching the accessory filters
    fn list_accessories(&self) -> Vec<AccessoryDescriptor> {
        let devices = match self.context.devices() {
            Ok(devices) => devices,
            Err(e) => {
                warn!("failed to enumerate usb devices: {}", e);
                return Vec::new();
            }
        };

        devices
            .iter()
            .filter_map(|device| describe_if_accessory(&device, &self.filters))
            .collect()
    }
}

/// Hot-plug callback handler
///
/// Tracks which matched accessories are present so departures of unrelated
/// devices never produce a Detached event.
struct AccessoryHotplug {
    event_tx: async_channel::Sender<AccessoryEvent>,
    filters: Vec<String>,
    present: Arc<Mutex<HashSet<(u8, u8)>>>,
}

impl<T: UsbContext> Hotplug<T> for AccessoryHotplug {
    fn device_arrived(&mut self, device: Device<T>) {
        let Some(descriptor) = describe_if_accessory(&device, &self.filters) else {
            return;
        };

        let key = (device.bus_number(), device.address());
        let fresh = self
            .present
            .lock()
            .expect("present accessory lock poisoned")
            .insert(key);
        if !fresh {
            return;
        }

        info!(bus = key.0, addr = key.1, "tether accessory arrived");
        if let Err(e) = self
            .event_tx
            .send_blocking(AccessoryEvent::Attached(descriptor))
        {
            warn!("failed to deliver attach event: {}", e);
        }
    }

    fn device_left(&mut self, device: Device<T>) {
        let key = (device.bus_number(), device.address());
        let tracked = self
            .present
            .lock()
            .expect("present accessory lock poisoned")
            .remove(&key);
        if !tracked {
            return;
        }

        info!(bus = key.0, addr = key.1, "tether accessory left");
        if let Err(e) = self.event_tx.send_blocking(AccessoryEvent::Detached) {
            warn!("failed to deliver detach event: {}", e);
        }
    }
}

/// Build a descriptor for the device if it matches the accessory filters
fn describe_if_accessory<T: UsbContext>(
    device: &Device<T>,
    filters: &[String],
) -> Option<AccessoryDescriptor> {
    let descriptor = match device.device_descriptor() {
        Ok(d) => d,
        Err(e) => {
            debug!("failed to read device descriptor: {}", e);
            return None;
        }
    };

    if !matches_filter(descriptor.vendor_id(), descriptor.product_id(), filters) {
        return None;
    }

    // String descriptors need the device opened; reading can fail without
    // permissions, in which case the session falls back to the default
    // addressing
    let strings = device.open().ok().map(|handle| {
        let product = descriptor
            .product_string_index()
            .and_then(|_| handle.read_product_string_ascii(&descriptor).ok());
        let serial = descriptor
            .serial_number_string_index()
            .and_then(|_| handle.read_serial_number_string_ascii(&descriptor).ok());
        (product, serial)
    });
    let (product, serial) = strings.unwrap_or((None, None));

    Some(AccessoryDescriptor {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        bus_number: device.bus_number(),
        device_address: device.address(),
        product,
        serial,
    })
}

/// Match a VID/PID pair against "0xVID:0xPID" patterns ("*" wildcards)
///
/// An empty filter list matches nothing: a tether accessory must be
/// explicitly identified.
fn matches_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    filters.iter().any(|filter| {
        let Some((vid_pattern, pid_pattern)) = filter.split_once(':') else {
            return false;
        };
        part_matches(vid_pattern, vid) && part_matches(pid_pattern, pid)
    })
}

fn part_matches(pattern: &str, value: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    u16::from_str_radix(
        pattern.trim_start_matches("0x").trim_start_matches("0X"),
        16,
    )
    .map(|p| p == value)
    .unwrap_or(false)
}

/// Spawn the USB watcher thread
///
/// Creates a dedicated OS thread for libusb work and returns its join
/// handle. The thread runs until a Shutdown command is received.
pub fn spawn_accessory_watcher(
    worker: AccessoryWorker,
    filters: Vec<String>,
) -> std::thread::JoinHandle<Result<(), rusb::Error>> {
    std::thread::Builder::new()
        .name("usb-watcher".to_string())
        .spawn(move || {
            let mut watcher = AccessoryWatcher::new(worker, filters)?;
            watcher.initialize()?;
            watcher.run()
        })
        .expect("Failed to spawn usb watcher thread")
}
