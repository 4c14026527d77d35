//! Packet relay engine
//!
//! Shuttles raw bytes between the TUN handle and the accessory handle, one
//! dedicated thread per direction. The session manager depends only on the
//! `ForwardingEngine` trait; `RelayEngine` is the stock implementation.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use tracing::{debug, info, warn};

/// Relay buffer, sized to hold a full MTU frame with headroom
const RELAY_BUF_SIZE: usize = 4096;

/// Poll interval for the copy loops; bounds how long stop() can take
const POLL_INTERVAL_MS: u8 = 100;

/// Notification that the engine stopped on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineFault;

/// Bidirectional forwarding between two duplex byte-stream handles
///
/// The caller guarantees at most one concurrent `start`; `stop` must be
/// safe to call even when nothing is running.
pub trait ForwardingEngine: Send {
    /// Take ownership of both handles and begin forwarding
    fn start(&mut self, tun: File, accessory: File);

    /// Stop forwarding and release the handles. Idempotent.
    fn stop(&mut self);

    /// Whether a forwarding session is currently live
    fn is_running(&self) -> bool;
}

/// Thread-per-direction byte relay
pub struct RelayEngine {
    running: Arc<AtomicBool>,
    threads: Vec<thread::JoinHandle<()>>,
    fault_tx: async_channel::Sender<EngineFault>,
}

impl RelayEngine {
    /// Create an engine that reports abnormal stops on `fault_tx`
    pub fn new(fault_tx: async_channel::Sender<EngineFault>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
            fault_tx,
        }
    }

    fn spawn_direction(&mut self, name: &str, src: File, dst: File) {
        let running = self.running.clone();
        let fault_tx = self.fault_tx.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                relay_loop(src, dst, &running);
                // The first direction to die takes the engine down and is
                // the only one that reports the fault.
                if running.swap(false, Ordering::SeqCst) {
                    debug!("relay direction ended, reporting engine fault");
                    let _ = fault_tx.try_send(EngineFault);
                }
            })
            .expect("failed to spawn relay thread");
        self.threads.push(handle);
    }
}

impl ForwardingEngine for RelayEngine {
    fn start(&mut self, tun: File, accessory: File) {
        // Each direction reads one handle and writes the other, so both
        // handles need a second fd referencing the same description.
        let (tun_rd, acc_wr) = match (tun.try_clone(), accessory.try_clone()) {
            (Ok(t), Ok(a)) => (t, a),
            (Err(e), _) | (_, Err(e)) => {
                warn!("could not clone tunnel handles: {}", e);
                let _ = self.fault_tx.try_send(EngineFault);
                return;
            }
        };

        self.running.store(true, Ordering::SeqCst);
        self.spawn_direction("relay-tun-acc", tun_rd, acc_wr);
        self.spawn_direction("relay-acc-tun", accessory, tun);
        info!("relay engine started");
    }

    fn stop(&mut self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);

        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                warn!("relay thread panicked");
            }
        }

        if was_running {
            info!("relay engine stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Copy bytes from `src` to `dst` until the engine stops or the stream ends
///
/// Reads are gated on poll(2) with a timeout so the loop notices a cleared
/// running flag without needing a wakeup packet.
fn relay_loop(mut src: File, mut dst: File, running: &AtomicBool) {
    let mut buf = [0u8; RELAY_BUF_SIZE];

    while running.load(Ordering::SeqCst) {
        let ready = {
            let mut fds = [PollFd::new(src.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(POLL_INTERVAL_MS)) {
                Ok(n) => n,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("poll failed on relay handle: {}", e);
                    break;
                }
            }
        };

        if ready == 0 {
            continue;
        }

        match src.read(&mut buf) {
            Ok(0) => {
                debug!("relay source reached end of stream");
                break;
            }
            Ok(n) => {
                if let Err(e) = dst.write_all(&buf[..n]) {
                    warn!("relay write failed: {}", e);
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("relay read failed: {}", e);
                break;
            }
        }
    }
}
