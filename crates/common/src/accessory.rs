//! Accessory descriptor

/// Description of an attached tether accessory
///
/// A snapshot of the USB descriptor data for a device that matched the
/// configured accessory filters. The serial string doubles as the
/// addressing token the peer uses to hand us tunnel addressing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessoryDescriptor {
    /// USB Vendor ID
    pub vendor_id: u16,
    /// USB Product ID
    pub product_id: u16,
    /// Bus number
    pub bus_number: u8,
    /// Device address on the bus
    pub device_address: u8,
    /// Product string (if readable)
    pub product: Option<String>,
    /// Serial string; carries "address,dns_server" when the peer supplies
    /// addressing metadata
    pub serial: Option<String>,
}

impl AccessoryDescriptor {
    /// The addressing token carried by the accessory, empty when absent
    pub fn serial_token(&self) -> &str {
        self.serial.as_deref().unwrap_or("")
    }
}
