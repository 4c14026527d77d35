//! Virtual interface provisioning
//!
//! Builds the TUN device with tun-rs, installs the catch-all route and
//! surrenders the raw packet fd to the session as a plain File.

use std::fs::File;
use std::net::Ipv4Addr;
use std::os::fd::{FromRawFd, IntoRawFd};
use std::process::Command;

use tether::{AddressConfig, InterfaceProvisioner, ProvisionError, TunInterface};
use tracing::{debug, info, warn};

use crate::config::TunnelSettings;

/// MTU of the tunnel interface
const TUN_MTU: u16 = 1500;

pub struct TunProvisioner {
    settings: TunnelSettings,
}

impl TunProvisioner {
    pub fn new(settings: TunnelSettings) -> Self {
        Self { settings }
    }
}

fn parse_ipv4(value: &str, what: &str) -> Result<Ipv4Addr, ProvisionError> {
    value
        .parse()
        .map_err(|_| ProvisionError::InvalidAddress(format!("{} {:?}", what, value)))
}

impl InterfaceProvisioner for TunProvisioner {
    fn establish(&mut self, config: &AddressConfig) -> Result<TunInterface, ProvisionError> {
        let address = parse_ipv4(&config.address, "tunnel address")?;
        // applied best-effort below, but a malformed server is still a
        // configuration the platform cannot honor
        let dns = parse_ipv4(&config.dns_server, "dns server")?;

        let mut builder = tun_rs::DeviceBuilder::new()
            .mtu(TUN_MTU)
            .ipv4(address, config.prefix_len, None);
        if let Some(ifname) = &self.settings.ifname {
            builder = builder.name(ifname.as_str());
        }

        let device = builder.build_sync().map_err(ProvisionError::Device)?;
        let name = device.name().map_err(ProvisionError::Device)?;

        info!(
            interface = %name,
            address = %address,
            prefix = config.prefix_len,
            "virtual interface established"
        );

        install_default_route(&name)?;
        configure_dns(&name, dns);

        // Keeping pre-existing connections off the tunnel has no generic
        // Linux equivalent; best-effort means noting the absence.
        debug!("connection bypass not supported on this platform");

        // The relay engine wants a plain byte-stream handle.
        // SAFETY: into_raw_fd transfers ownership of the device fd.
        let handle = unsafe { File::from_raw_fd(device.into_raw_fd()) };

        Ok(TunInterface { handle, name })
    }
}

fn install_default_route(ifname: &str) -> Result<(), ProvisionError> {
    let output = Command::new("ip")
        .args(["route", "replace", "default", "dev", ifname])
        .output()
        .map_err(|e| ProvisionError::Route(e.to_string()))?;

    if !output.status.success() {
        return Err(ProvisionError::Route(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    debug!(interface = %ifname, "default route installed");
    Ok(())
}

/// Point the resolver at the tunnel DNS server
///
/// Best-effort: hosts without systemd-resolved keep their existing
/// resolver configuration.
fn configure_dns(ifname: &str, dns: Ipv4Addr) {
    match Command::new("resolvectl")
        .args(["dns", ifname, &dns.to_string()])
        .output()
    {
        Ok(output) if output.status.success() => {
            debug!(interface = %ifname, dns = %dns, "tunnel dns configured");
        }
        Ok(output) => {
            warn!(
                "could not configure tunnel dns: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => {
            warn!("resolvectl unavailable, keeping existing dns: {}", e);
        }
    }
}
