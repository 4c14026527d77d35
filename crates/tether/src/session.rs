//! Tethering session manager
//!
//! The state machine between the hardware notifications and the relay
//! engine. Exactly one session can be live at a time; every transition runs
//! under a single mutex so a detach can never race an attach in progress.

use std::fs::File;
use std::sync::{Mutex, MutexGuard};

use common::AccessoryDescriptor;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::addr::{self, AddressConfig};
use crate::engine::ForwardingEngine;

/// User-visible message for an attach event with no usable accessory
pub const MSG_NO_ACCESSORY: &str = "no accessory attached";
/// User-visible message when the accessory channel cannot be opened
pub const MSG_ACCESSORY_OPEN: &str = "failed to open accessory";
/// User-visible message when the virtual interface cannot be established
pub const MSG_TUN_FAILED: &str = "failed to establish virtual interface";

/// Lifecycle state of the tethering session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session; waiting for an accessory
    Idle,
    /// Acquiring handles for a fresh attachment
    Provisioning,
    /// Forwarding engine live, status published
    Running,
    /// Teardown in progress
    Stopping,
}

/// Interface establishment failures
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The derived addressing does not parse
    #[error("invalid tunnel address: {0}")]
    InvalidAddress(String),

    /// The platform declined to create the device
    #[error("failed to create virtual interface: {0}")]
    Device(#[from] std::io::Error),

    /// The catch-all route could not be installed
    #[error("failed to install tunnel route: {0}")]
    Route(String),
}

/// Detach subscription could not be established
#[derive(Debug, Error)]
#[error("attachment watcher unavailable: {0}")]
pub struct WatcherError(pub String);

/// Session-level failures, all resolving back to Idle
#[derive(Debug, Error)]
pub enum SessionError {
    /// Attach rejected because a session is already live. By design this
    /// is never surfaced to the error sink.
    #[error("a tethering session is already active")]
    SessionActive,

    /// The attach event carried no usable accessory descriptor
    #[error("no usable accessory descriptor")]
    NoAccessory,

    /// The accessory channel could not be opened
    #[error("failed to open accessory channel")]
    AccessoryOpen(#[source] std::io::Error),

    /// The virtual interface could not be established
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    /// Detach notifications could not be subscribed
    #[error("attachment watcher unavailable")]
    WatcherUnavailable(#[source] WatcherError),
}

/// An established virtual interface: the raw packet handle plus the name
/// the platform assigned to it
pub struct TunInterface {
    pub handle: File,
    pub name: String,
}

/// Subscription handle returned by [`DetachWatcher::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchToken(pub u64);

/// Handle for a published status indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusToken(pub u64);

/// Facts about a running session, for the status publisher
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub address: String,
    pub prefix_len: u8,
    pub dns_server: String,
    pub interface: String,
}

/// Opens the accessory byte-stream channel
pub trait AccessoryOpener: Send {
    fn open(&mut self, accessory: &AccessoryDescriptor) -> std::io::Result<File>;
}

/// Provisions the virtual network interface
pub trait InterfaceProvisioner: Send {
    fn establish(&mut self, config: &AddressConfig) -> Result<TunInterface, ProvisionError>;
}

/// Per-session subscription to detach notifications
///
/// The session manager registers on entry to Running and must unregister
/// during teardown; a subscription left armed after the session ends leaks
/// detach deliveries into the next attach attempt.
pub trait DetachWatcher: Send {
    fn register(&mut self) -> Result<WatchToken, WatcherError>;
    fn unregister(&mut self, token: WatchToken);
}

/// Maintains the persistent "session active" indicator and advertises the
/// tunnel as an available network path (best-effort)
pub trait StatusPublisher: Send {
    fn publish(&mut self, info: &SessionInfo) -> StatusToken;
    fn retract(&mut self, token: StatusToken);
}

/// One-way sink for user-facing error messages
pub trait ErrorSink: Send {
    fn report(&mut self, message: &str);
}

/// Resources held while a session is Running
struct ActiveSession {
    watch: WatchToken,
    status: StatusToken,
    config: AddressConfig,
}

struct Inner {
    state: SessionState,
    engine: Box<dyn ForwardingEngine>,
    opener: Box<dyn AccessoryOpener>,
    provisioner: Box<dyn InterfaceProvisioner>,
    watcher: Box<dyn DetachWatcher>,
    status: Box<dyn StatusPublisher>,
    errors: Box<dyn ErrorSink>,
    session: Option<ActiveSession>,
}

/// Orchestrates one tethering session end to end
///
/// All entry points (`on_attach`, `on_detach`, `stop`, `on_engine_fault`)
/// may be called from any thread; transitions are serialized internally.
pub struct SessionManager {
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(
        engine: Box<dyn ForwardingEngine>,
        opener: Box<dyn AccessoryOpener>,
        provisioner: Box<dyn InterfaceProvisioner>,
        watcher: Box<dyn DetachWatcher>,
        status: Box<dyn StatusPublisher>,
        errors: Box<dyn ErrorSink>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                engine,
                opener,
                provisioner,
                watcher,
                status,
                errors,
                session: None,
            }),
        }
    }

    fn locked(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("session state lock poisoned")
    }

    /// Current lifecycle state, for observation only
    pub fn state(&self) -> SessionState {
        self.locked().state
    }

    /// Local addressing of the running session, if any
    pub fn address_config(&self) -> Option<AddressConfig> {
        self.locked().session.as_ref().map(|s| s.config.clone())
    }

    /// Handle an accessory attachment notification
    ///
    /// Rejected without side effects while a session exists in any state
    /// other than Idle; this is what enforces the single-session
    /// invariant.
    pub fn on_attach(
        &self,
        accessory: Option<&AccessoryDescriptor>,
    ) -> Result<(), SessionError> {
        let mut inner = self.locked();

        if inner.state != SessionState::Idle {
            warn!(state = ?inner.state, "attach rejected, session already active");
            return Err(SessionError::SessionActive);
        }

        let Some(accessory) = accessory else {
            warn!("attach event without accessory descriptor");
            inner.errors.report(MSG_NO_ACCESSORY);
            return Err(SessionError::NoAccessory);
        };

        inner.state = SessionState::Provisioning;
        match inner.provision(accessory) {
            Ok(()) => {
                inner.state = SessionState::Running;
                info!("tethering session running");
                Ok(())
            }
            Err(e) => {
                inner.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    /// Handle a detach notification. Tolerates duplicate or late signals.
    pub fn on_detach(&self) {
        self.locked().teardown("accessory detached");
    }

    /// Explicit stop request; same teardown path as a detach
    pub fn stop(&self) {
        self.locked().teardown("stop requested");
    }

    /// The forwarding engine stopped on its own; treated as a detach
    pub fn on_engine_fault(&self) {
        self.locked().teardown("engine fault");
    }
}

impl Inner {
    fn provision(&mut self, accessory: &AccessoryDescriptor) -> Result<(), SessionError> {
        let config = addr::derive(accessory.serial_token());
        debug!(
            address = %config.address,
            prefix = config.prefix_len,
            dns = %config.dns_server,
            "derived tunnel addressing"
        );

        let accessory_handle = match self.opener.open(accessory) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("failed to open accessory channel: {}", e);
                self.errors.report(MSG_ACCESSORY_OPEN);
                return Err(SessionError::AccessoryOpen(e));
            }
        };

        let tun = match self.provisioner.establish(&config) {
            Ok(tun) => tun,
            Err(e) => {
                // accessory_handle drops here, releasing the channel
                warn!("failed to establish virtual interface: {}", e);
                self.errors.report(MSG_TUN_FAILED);
                return Err(SessionError::Provision(e));
            }
        };

        let watch = match self.watcher.register() {
            Ok(token) => token,
            Err(e) => {
                // both handles drop on return; not part of the user-facing
                // message set, so log only
                warn!("detach watcher registration failed: {}", e);
                return Err(SessionError::WatcherUnavailable(e));
            }
        };

        let info = SessionInfo {
            address: config.address.clone(),
            prefix_len: config.prefix_len,
            dns_server: config.dns_server.clone(),
            interface: tun.name.clone(),
        };

        // Both handles move into the engine; ownership only comes back
        // through stop().
        self.engine.start(tun.handle, accessory_handle);
        let status = self.status.publish(&info);

        self.session = Some(ActiveSession {
            watch,
            status,
            config,
        });
        Ok(())
    }

    fn teardown(&mut self, trigger: &str) {
        if self.state != SessionState::Running {
            debug!(state = ?self.state, trigger, "teardown ignored, no running session");
            return;
        }

        self.state = SessionState::Stopping;
        info!(trigger, "stopping tethering session");

        if let Some(session) = self.session.take() {
            self.watcher.unregister(session.watch);
            // tolerates the engine having already stopped on its own
            self.engine.stop();
            self.status.retract(session.status);
        }

        self.state = SessionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    /// Shared ordered log of collaborator calls
    #[derive(Default, Clone)]
    struct Recorder(Arc<StdMutex<Vec<String>>>);

    impl Recorder {
        fn push(&self, entry: impl Into<String>) {
            self.0.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.0.lock().unwrap().clone()
        }

        fn count(&self, entry: &str) -> usize {
            self.entries().iter().filter(|e| *e == entry).count()
        }
    }

    struct FakeEngine {
        rec: Recorder,
        running: bool,
    }

    impl ForwardingEngine for FakeEngine {
        fn start(&mut self, _tun: File, _accessory: File) {
            self.rec.push("engine.start");
            self.running = true;
        }

        fn stop(&mut self) {
            self.rec.push("engine.stop");
            self.running = false;
        }

        fn is_running(&self) -> bool {
            self.running
        }
    }

    struct FakeOpener {
        rec: Recorder,
        fail: bool,
    }

    impl AccessoryOpener for FakeOpener {
        fn open(&mut self, _accessory: &AccessoryDescriptor) -> std::io::Result<File> {
            self.rec.push("open");
            if self.fail {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::PermissionDenied,
                    "denied",
                ));
            }
            tempfile::tempfile()
        }
    }

    struct FakeProvisioner {
        rec: Recorder,
        fail: bool,
    }

    impl InterfaceProvisioner for FakeProvisioner {
        fn establish(&mut self, config: &AddressConfig) -> Result<TunInterface, ProvisionError> {
            self.rec.push(format!(
                "establish {}/{}",
                config.address, config.prefix_len
            ));
            if self.fail {
                return Err(ProvisionError::Route("permission denied".to_string()));
            }
            Ok(TunInterface {
                handle: tempfile::tempfile().unwrap(),
                name: "tun0".to_string(),
            })
        }
    }

    struct FakeWatcher {
        rec: Recorder,
        fail: bool,
        next: u64,
    }

    impl DetachWatcher for FakeWatcher {
        fn register(&mut self) -> Result<WatchToken, WatcherError> {
            if self.fail {
                return Err(WatcherError("subscription refused".to_string()));
            }
            self.rec.push("register");
            self.next += 1;
            Ok(WatchToken(self.next))
        }

        fn unregister(&mut self, _token: WatchToken) {
            self.rec.push("unregister");
        }
    }

    struct FakeStatus {
        rec: Recorder,
        next: u64,
    }

    impl StatusPublisher for FakeStatus {
        fn publish(&mut self, info: &SessionInfo) -> StatusToken {
            self.rec.push(format!(
                "publish {}/{} dns {}",
                info.address, info.prefix_len, info.dns_server
            ));
            self.next += 1;
            StatusToken(self.next)
        }

        fn retract(&mut self, _token: StatusToken) {
            self.rec.push("retract");
        }
    }

    struct FakeErrors {
        rec: Recorder,
    }

    impl ErrorSink for FakeErrors {
        fn report(&mut self, message: &str) {
            self.rec.push(format!("error: {}", message));
        }
    }

    #[derive(Default)]
    struct Failures {
        open: bool,
        provision: bool,
        watcher: bool,
    }

    fn manager(rec: &Recorder, fail: Failures) -> SessionManager {
        SessionManager::new(
            Box::new(FakeEngine {
                rec: rec.clone(),
                running: false,
            }),
            Box::new(FakeOpener {
                rec: rec.clone(),
                fail: fail.open,
            }),
            Box::new(FakeProvisioner {
                rec: rec.clone(),
                fail: fail.provision,
            }),
            Box::new(FakeWatcher {
                rec: rec.clone(),
                fail: fail.watcher,
                next: 0,
            }),
            Box::new(FakeStatus {
                rec: rec.clone(),
                next: 0,
            }),
            Box::new(FakeErrors { rec: rec.clone() }),
        )
    }

    fn descriptor(serial: &str) -> AccessoryDescriptor {
        AccessoryDescriptor {
            vendor_id: 0x18d1,
            product_id: 0x2d00,
            bus_number: 1,
            device_address: 4,
            product: Some("tether".to_string()),
            serial: Some(serial.to_string()),
        }
    }

    #[test]
    fn test_round_trip_returns_to_idle() {
        let rec = Recorder::default();
        let session = manager(&rec, Failures::default());

        assert_eq!(session.state(), SessionState::Idle);
        session.on_attach(Some(&descriptor("garbage"))).unwrap();
        assert_eq!(session.state(), SessionState::Running);

        session.on_detach();
        assert_eq!(session.state(), SessionState::Idle);

        assert_eq!(
            rec.entries(),
            vec![
                "open",
                "establish 10.10.10.2/30",
                "register",
                "engine.start",
                "publish 10.10.10.2/30 dns 8.8.8.8",
                "unregister",
                "engine.stop",
                "retract",
            ]
        );
    }

    #[test]
    fn test_token_addressing_reaches_publisher() {
        let rec = Recorder::default();
        let session = manager(&rec, Failures::default());

        session
            .on_attach(Some(&descriptor("192.168.50.2,1.1.1.1")))
            .unwrap();

        let config = session.address_config().unwrap();
        assert_eq!(config.address, "192.168.50.2");
        assert_eq!(config.dns_server, "1.1.1.1");
        assert_eq!(config.prefix_len, 24);
        assert_eq!(rec.count("publish 192.168.50.2/24 dns 1.1.1.1"), 1);
    }

    #[test]
    fn test_second_attach_rejected_while_running() {
        let rec = Recorder::default();
        let session = manager(&rec, Failures::default());

        session.on_attach(Some(&descriptor("garbage"))).unwrap();
        let result = session.on_attach(Some(&descriptor("10.0.0.2,1.1.1.1")));

        assert!(matches!(result, Err(SessionError::SessionActive)));
        assert_eq!(session.state(), SessionState::Running);
        // the existing session is untouched and the duplicate is silent
        assert_eq!(rec.count("engine.start"), 1);
        assert_eq!(session.address_config().unwrap().address, "10.10.10.2");
        assert!(rec.entries().iter().all(|e| !e.starts_with("error:")));
    }

    #[test]
    fn test_attach_without_descriptor() {
        let rec = Recorder::default();
        let session = manager(&rec, Failures::default());

        let result = session.on_attach(None);

        assert!(matches!(result, Err(SessionError::NoAccessory)));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(rec.entries(), vec!["error: no accessory attached"]);
    }

    #[test]
    fn test_accessory_open_failure() {
        let rec = Recorder::default();
        let session = manager(
            &rec,
            Failures {
                open: true,
                ..Failures::default()
            },
        );

        let result = session.on_attach(Some(&descriptor("garbage")));

        assert!(matches!(result, Err(SessionError::AccessoryOpen(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(rec.entries(), vec!["open", "error: failed to open accessory"]);
    }

    #[test]
    fn test_provision_failure_never_starts_engine() {
        let rec = Recorder::default();
        let session = manager(
            &rec,
            Failures {
                provision: true,
                ..Failures::default()
            },
        );

        let result = session.on_attach(Some(&descriptor("garbage")));

        assert!(matches!(result, Err(SessionError::Provision(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(rec.count("engine.start"), 0);
        assert_eq!(rec.count("register"), 0);
        assert_eq!(
            rec.count("error: failed to establish virtual interface"),
            1
        );

        // a later attach starts cleanly
        let rec2 = Recorder::default();
        let session = manager(&rec2, Failures::default());
        session.on_attach(Some(&descriptor("garbage"))).unwrap();
        assert_eq!(session.state(), SessionState::Running);
    }

    #[test]
    fn test_provision_failure_releases_accessory_handle() {
        use nix::sys::socket::{AddressFamily, SockFlag, SockType, socketpair};
        use std::io::Read;

        struct PairOpener {
            rec: Recorder,
            handle: Option<File>,
        }

        impl AccessoryOpener for PairOpener {
            fn open(&mut self, _accessory: &AccessoryDescriptor) -> std::io::Result<File> {
                self.rec.push("open");
                Ok(self.handle.take().expect("accessory opened twice"))
            }
        }

        let (ours, peer) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .unwrap();
        let mut peer = File::from(peer);

        let rec = Recorder::default();
        let session = SessionManager::new(
            Box::new(FakeEngine {
                rec: rec.clone(),
                running: false,
            }),
            Box::new(PairOpener {
                rec: rec.clone(),
                handle: Some(File::from(ours)),
            }),
            Box::new(FakeProvisioner {
                rec: rec.clone(),
                fail: true,
            }),
            Box::new(FakeWatcher {
                rec: rec.clone(),
                fail: false,
                next: 0,
            }),
            Box::new(FakeStatus {
                rec: rec.clone(),
                next: 0,
            }),
            Box::new(FakeErrors { rec: rec.clone() }),
        );

        assert!(session.on_attach(Some(&descriptor("garbage"))).is_err());

        // the accessory handle was dropped: its peer observes end of stream
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).unwrap(), 0);
        assert_eq!(rec.count("engine.start"), 0);
    }

    #[test]
    fn test_watcher_failure_aborts_without_engine_start() {
        let rec = Recorder::default();
        let session = manager(
            &rec,
            Failures {
                watcher: true,
                ..Failures::default()
            },
        );

        let result = session.on_attach(Some(&descriptor("garbage")));

        assert!(matches!(result, Err(SessionError::WatcherUnavailable(_))));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(rec.count("engine.start"), 0);
        // watcher failure is logged, never user-reported
        assert!(rec.entries().iter().all(|e| !e.starts_with("error:")));
    }

    #[test]
    fn test_stop_on_idle_has_no_side_effects() {
        let rec = Recorder::default();
        let session = manager(&rec, Failures::default());

        session.stop();
        session.stop();

        assert_eq!(session.state(), SessionState::Idle);
        assert!(rec.entries().is_empty());
    }

    #[test]
    fn test_duplicate_detach_tears_down_once() {
        let rec = Recorder::default();
        let session = manager(&rec, Failures::default());

        session.on_attach(Some(&descriptor("garbage"))).unwrap();
        session.on_detach();
        session.on_detach();
        session.stop();

        assert_eq!(rec.count("engine.stop"), 1);
        assert_eq!(rec.count("retract"), 1);
        assert_eq!(rec.count("unregister"), 1);
    }

    #[test]
    fn test_engine_fault_tears_down() {
        let rec = Recorder::default();
        let session = manager(&rec, Failures::default());

        session.on_attach(Some(&descriptor("garbage"))).unwrap();
        session.on_engine_fault();

        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(rec.count("engine.stop"), 1);
        assert_eq!(rec.count("retract"), 1);
    }
}
