//! Session status publishing
//!
//! Maps the session manager's status contract onto sd-notify: the
//! persistent indicator is the STATUS line visible in `systemctl status`,
//! retracted unconditionally when the session ends. Advertising the tunnel
//! as the machine's network path is a best-effort check that the default
//! route actually points at the interface.

use std::process::Command;

use tether::{ErrorSink, SessionInfo, StatusPublisher, StatusToken};
use tracing::{debug, error, info, warn};

use crate::service;

pub struct ServiceStatus {
    next_token: u64,
    current: Option<StatusToken>,
}

impl ServiceStatus {
    pub fn new() -> Self {
        Self {
            next_token: 0,
            current: None,
        }
    }
}

impl Default for ServiceStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusPublisher for ServiceStatus {
    fn publish(&mut self, info: &SessionInfo) -> StatusToken {
        let label = format!(
            "tethering active: {}/{} via {} (dns {})",
            info.address, info.prefix_len, info.interface, info.dns_server
        );
        if let Err(e) = service::notify_status(&label) {
            warn!("failed to publish service status: {:#}", e);
        }
        info!("{}", label);

        advertise_network_path(&info.interface);

        self.next_token += 1;
        let token = StatusToken(self.next_token);
        self.current = Some(token);
        token
    }

    fn retract(&mut self, token: StatusToken) {
        if self.current != Some(token) {
            debug!(?token, "ignoring retract for stale status token");
            return;
        }
        self.current = None;

        if let Err(e) = service::notify_status("idle, waiting for tether accessory") {
            warn!("failed to clear service status: {:#}", e);
        }
        info!("tethering status retracted");
    }
}

/// Confirm the tunnel is the machine's default network path
///
/// Best-effort: a negative or failed check is logged, never fatal.
fn advertise_network_path(ifname: &str) {
    match Command::new("ip")
        .args(["-o", "route", "show", "default"])
        .output()
    {
        Ok(output) if output.status.success() => {
            let routes = String::from_utf8_lossy(&output.stdout);
            if routes.contains(ifname) {
                info!(interface = %ifname, "tunnel advertised as default network path");
            } else {
                warn!(interface = %ifname, "tunnel is not the default network path");
            }
        }
        Ok(output) => {
            warn!(
                "could not inspect default route: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Err(e) => {
            debug!("route inspection unavailable: {}", e);
        }
    }
}

/// Error sink for headless operation: failures land in the journal
pub struct LogErrorSink;

impl ErrorSink for LogErrorSink {
    fn report(&mut self, message: &str) {
        error!("{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SessionInfo {
        SessionInfo {
            address: "10.10.10.2".to_string(),
            prefix_len: 30,
            dns_server: "8.8.8.8".to_string(),
            interface: "tun0".to_string(),
        }
    }

    #[test]
    fn test_publish_allocates_fresh_tokens() {
        unsafe {
            std::env::remove_var("NOTIFY_SOCKET");
        }
        let mut status = ServiceStatus::new();

        let first = status.publish(&info());
        status.retract(first);
        let second = status.publish(&info());

        assert_ne!(first, second);
    }

    #[test]
    fn test_stale_retract_is_ignored() {
        unsafe {
            std::env::remove_var("NOTIFY_SOCKET");
        }
        let mut status = ServiceStatus::new();

        let first = status.publish(&info());
        let second = status.publish(&info());

        // retracting the superseded token leaves the current one in place
        status.retract(first);
        assert_eq!(status.current, Some(second));

        status.retract(second);
        assert_eq!(status.current, None);
    }
}
