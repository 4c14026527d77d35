//! Session lifecycle integration tests
//!
//! Exercises the session manager through the public crate API only:
//! - concurrent attach attempts respect the single-session invariant
//! - a full attach/detach round trip releases every resource
//!
//! Run with: `cargo test -p tether --test lifecycle`

use std::fs::File;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::AccessoryDescriptor;
use tether::{
    AccessoryOpener, AddressConfig, DetachWatcher, ErrorSink, ForwardingEngine,
    InterfaceProvisioner, ProvisionError, SessionInfo, SessionManager, SessionState,
    StatusPublisher, StatusToken, TunInterface, WatchToken, WatcherError,
};

#[derive(Default, Clone)]
struct Counters {
    engine_starts: Arc<AtomicUsize>,
    engine_stops: Arc<AtomicUsize>,
    publishes: Arc<AtomicUsize>,
    retracts: Arc<AtomicUsize>,
    reports: Arc<AtomicUsize>,
}

struct CountingEngine(Counters, bool);

impl ForwardingEngine for CountingEngine {
    fn start(&mut self, _tun: File, _accessory: File) {
        self.0.engine_starts.fetch_add(1, Ordering::SeqCst);
        self.1 = true;
    }

    fn stop(&mut self) {
        self.0.engine_stops.fetch_add(1, Ordering::SeqCst);
        self.1 = false;
    }

    fn is_running(&self) -> bool {
        self.1
    }
}

struct TempfileOpener;

impl AccessoryOpener for TempfileOpener {
    fn open(&mut self, _accessory: &AccessoryDescriptor) -> std::io::Result<File> {
        tempfile::tempfile()
    }
}

struct TempfileProvisioner;

impl InterfaceProvisioner for TempfileProvisioner {
    fn establish(&mut self, _config: &AddressConfig) -> Result<TunInterface, ProvisionError> {
        Ok(TunInterface {
            handle: tempfile::tempfile().unwrap(),
            name: "tun0".to_string(),
        })
    }
}

struct NullWatcher(u64);

impl DetachWatcher for NullWatcher {
    fn register(&mut self) -> Result<WatchToken, WatcherError> {
        self.0 += 1;
        Ok(WatchToken(self.0))
    }

    fn unregister(&mut self, _token: WatchToken) {}
}

struct CountingStatus(Counters, u64);

impl StatusPublisher for CountingStatus {
    fn publish(&mut self, _info: &SessionInfo) -> StatusToken {
        self.0.publishes.fetch_add(1, Ordering::SeqCst);
        self.1 += 1;
        StatusToken(self.1)
    }

    fn retract(&mut self, _token: StatusToken) {
        self.0.retracts.fetch_add(1, Ordering::SeqCst);
    }
}

struct CountingErrors(Counters);

impl ErrorSink for CountingErrors {
    fn report(&mut self, _message: &str) {
        self.0.reports.fetch_add(1, Ordering::SeqCst);
    }
}

fn manager(counters: &Counters) -> SessionManager {
    SessionManager::new(
        Box::new(CountingEngine(counters.clone(), false)),
        Box::new(TempfileOpener),
        Box::new(TempfileProvisioner),
        Box::new(NullWatcher(0)),
        Box::new(CountingStatus(counters.clone(), 0)),
        Box::new(CountingErrors(counters.clone())),
    )
}

fn descriptor() -> AccessoryDescriptor {
    AccessoryDescriptor {
        vendor_id: 0x18d1,
        product_id: 0x2d00,
        bus_number: 1,
        device_address: 4,
        product: None,
        serial: Some("192.168.50.2,1.1.1.1".to_string()),
    }
}

#[test]
fn concurrent_attaches_start_exactly_one_session() {
    let counters = Counters::default();
    let session = Arc::new(manager(&counters));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let session = session.clone();
        handles.push(std::thread::spawn(move || {
            session.on_attach(Some(&descriptor())).is_ok()
        }));
    }

    let started: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap() as usize)
        .sum();

    assert_eq!(started, 1);
    assert_eq!(counters.engine_starts.load(Ordering::SeqCst), 1);
    assert_eq!(session.state(), SessionState::Running);
    // duplicate attaches are silent by design
    assert_eq!(counters.reports.load(Ordering::SeqCst), 0);
}

#[test]
fn round_trip_releases_everything_once() {
    let counters = Counters::default();
    let session = manager(&counters);

    session.on_attach(Some(&descriptor())).unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.address_config().unwrap().prefix_len, 24);

    session.on_detach();
    session.stop();

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(counters.engine_stops.load(Ordering::SeqCst), 1);
    assert_eq!(counters.publishes.load(Ordering::SeqCst), 1);
    assert_eq!(counters.retracts.load(Ordering::SeqCst), 1);
}
