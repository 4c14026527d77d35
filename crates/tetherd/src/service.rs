//! Systemd service integration
//!
//! sd-notify plumbing for the daemon: readiness, shutdown and status
//! notifications plus the optional watchdog keepalive. Everything is a
//! no-op when NOTIFY_SOCKET is absent, so the daemon behaves the same when
//! started from a shell.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use tracing::{debug, error, info};

/// Send one sd-notify message; Ok(false) when not running under systemd
fn notify(message: &str) -> Result<bool> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        return Ok(false);
    };

    let socket = UnixDatagram::unbound().context("Failed to create notify socket")?;
    socket
        .send_to(message.as_bytes(), &socket_path)
        .with_context(|| format!("Failed to send {} notification to systemd", message))?;
    Ok(true)
}

/// Notify systemd that the daemon finished initialization
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: ready");
    } else {
        debug!("NOTIFY_SOCKET not set, skipping systemd notification");
    }
    Ok(())
}

/// Notify systemd that the daemon entered its shutdown sequence
pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: stopping");
    }
    Ok(())
}

/// Publish a status line, visible in `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

/// Send a watchdog keepalive
pub fn notify_watchdog() -> Result<()> {
    notify("WATCHDOG=1").map(|_| ())
}

/// Watchdog timeout configured by systemd, in microseconds
///
/// Returns None if the watchdog is not enabled.
pub fn get_watchdog_timeout() -> Option<u64> {
    env::var("WATCHDOG_USEC").ok().and_then(|s| s.parse().ok())
}

/// Spawn the periodic watchdog keepalive task
///
/// Sends WATCHDOG=1 at half the configured interval. Returns a finished
/// no-op task when the watchdog is not enabled.
pub async fn spawn_watchdog_task() -> Result<tokio::task::JoinHandle<()>> {
    if let Some(timeout_usec) = get_watchdog_timeout() {
        let interval_secs = (timeout_usec / 1_000_000) / 2;
        let interval = std::time::Duration::from_secs(interval_secs.max(1));

        info!(
            "Systemd watchdog enabled, interval: {}s (timeout: {}s)",
            interval.as_secs(),
            timeout_usec / 1_000_000
        );

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if let Err(e) = notify_watchdog() {
                    error!("Failed to send watchdog keepalive: {:#}", e);
                }
            }
        });

        Ok(handle)
    } else {
        debug!("Systemd watchdog not enabled, skipping watchdog task");
        Ok(tokio::spawn(async {}))
    }
}
