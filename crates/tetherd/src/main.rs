//! usb-tetherd
//!
//! Host-side reverse tethering daemon. Watches for a tether accessory on
//! the USB bus, provisions a TUN interface with addressing supplied by the
//! accessory, and relays IP packets between the two until the accessory
//! detaches or the daemon is stopped.

mod config;
mod service;
mod status;
mod tun;
mod usb;

use anyhow::{Context, Result};
use clap::Parser;
use common::{AccessoryBridge, AccessoryCommand, AccessoryEvent, create_accessory_bridge, setup_logging};
use tether::{RelayEngine, SessionError, SessionManager};
use tokio::signal;
use tracing::{debug, error, info, warn};
use usb::spawn_accessory_watcher;

#[derive(Parser, Debug)]
#[command(name = "usb-tetherd")]
#[command(author, version, about = "USB reverse tethering daemon")]
#[command(long_about = "
Reverse tethers network access over a USB accessory link. When a tether
accessory attaches, the daemon derives tunnel addressing from the accessory
serial token, brings up a TUN interface and relays IP packets between the
interface and the accessory channel until the accessory detaches.

EXAMPLES:
    # Run with default config
    usb-tetherd

    # Run with custom config
    usb-tetherd --config /path/to/usb-tetherd.toml

    # List candidate accessories and exit
    usb-tetherd --list-accessories

    # Run under systemd with plain log output
    usb-tetherd --service

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-tether/usb-tetherd.toml
    3. /etc/usb-tether/usb-tetherd.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run as a systemd service (plain log output)
    #[arg(long)]
    service: bool,

    /// List candidate accessories and exit
    #[arg(long)]
    list_accessories: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle --save-config early (before loading config)
    if args.save_config {
        let config = config::DaemonConfig::default();
        let path = config::DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::DaemonConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        config::DaemonConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.daemon.log_level);
    let service_mode = args.service || config.daemon.service_mode;

    setup_logging(log_level, service_mode).context("Failed to setup logging")?;

    info!("usb-tetherd v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let (bridge, worker) = create_accessory_bridge();
    let watcher_handle = spawn_accessory_watcher(worker, config.usb.filters.clone());

    let result = if args.list_accessories {
        list_accessories_mode(bridge.clone()).await
    } else {
        run(config, bridge.clone()).await
    };

    // Cleanup: shut the watcher thread down
    if let Err(e) = bridge.send_command(AccessoryCommand::Shutdown).await {
        error!("Error shutting down usb watcher: {}", e);
    }
    match watcher_handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("usb watcher exited with error: {}", e),
        Err(_) => error!("usb watcher thread panicked"),
    }

    result
}

/// Print devices matching the accessory filters and exit
async fn list_accessories_mode(bridge: AccessoryBridge) -> Result<()> {
    let (tx, rx) = tokio::sync::oneshot::channel();
    bridge
        .send_command(AccessoryCommand::ListAccessories { response: tx })
        .await
        .context("usb watcher unavailable")?;

    let accessories = rx.await.context("usb watcher dropped the request")?;

    if accessories.is_empty() {
        println!("No tether accessories found");
        return Ok(());
    }

    println!("Tether accessories:");
    for acc in accessories {
        println!(
            "  {:04x}:{:04x} bus {} addr {}  product={}  serial={}",
            acc.vendor_id,
            acc.product_id,
            acc.bus_number,
            acc.device_address,
            acc.product.as_deref().unwrap_or("-"),
            acc.serial.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

/// Main daemon loop: pump attachment events into the session manager
async fn run(config: config::DaemonConfig, bridge: AccessoryBridge) -> Result<()> {
    let (fault_tx, fault_rx) = async_channel::bounded(1);

    let detach_gate = usb::DetachGate::new();
    let session = SessionManager::new(
        Box::new(RelayEngine::new(fault_tx)),
        Box::new(usb::DevNodeOpener::new(config.usb.accessory_path.clone())),
        Box::new(tun::TunProvisioner::new(config.tunnel.clone())),
        Box::new(detach_gate.clone()),
        Box::new(status::ServiceStatus::new()),
        Box::new(status::LogErrorSink),
    );

    service::notify_ready().context("sd-notify READY failed")?;
    service::notify_status("idle, waiting for tether accessory").ok();
    let watchdog = service::spawn_watchdog_task().await?;

    info!("waiting for tether accessory");

    loop {
        tokio::select! {
            event = bridge.recv_event() => match event {
                Ok(AccessoryEvent::Attached(descriptor)) => {
                    info!(
                        vid = format_args!("{:04x}", descriptor.vendor_id),
                        pid = format_args!("{:04x}", descriptor.product_id),
                        "accessory attached"
                    );
                    match session.on_attach(Some(&descriptor)) {
                        Ok(()) => {}
                        Err(SessionError::SessionActive) => {
                            // single-session invariant, nothing to do
                        }
                        Err(e) => warn!("session start failed: {}", e),
                    }
                }
                Ok(AccessoryEvent::Detached) => {
                    if detach_gate.is_armed() {
                        session.on_detach();
                    } else {
                        debug!("detach event ignored, no active subscription");
                    }
                }
                Err(e) => {
                    error!("accessory event channel closed: {}", e);
                    break;
                }
            },
            fault = fault_rx.recv() => {
                if fault.is_ok() {
                    warn!("forwarding engine stopped unexpectedly");
                    session.on_engine_fault();
                }
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received");
                break;
            }
        }
    }

    service::notify_stopping().ok();
    session.stop();
    watchdog.abort();
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = signal::ctrl_c();

    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            let _ = ctrl_c.await;
        }
    }
}
