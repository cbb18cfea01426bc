//! Session status reporting.
//!
//! The pump and state machine publish periodic [`StatusSnapshot`]s through a
//! [`StatusSink`]; what happens to them is the sink's business. The default
//! sink logs a compact line whenever the counters move; a no-op sink is
//! available for tests and for the device emulator.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::protocol::PeerRole;
use crate::session::{PeerIdentity, Phase};

/// Point-in-time view of a session, safe to render from any thread.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Local role.
    pub role: PeerRole,
    /// Local protocol version.
    pub version: &'static str,
    /// Peer identity, once its version frame arrived.
    pub peer: Option<PeerIdentity>,
    /// Local serial endpoint description.
    pub local_serial: String,
    /// Remote serial description, once announced.
    pub remote_serial: Option<String>,
    /// Current phase.
    pub phase: Phase,
    /// Payload bytes network→serial.
    pub in_bytes: u64,
    /// Payload bytes serial→network.
    pub out_bytes: u64,
    /// Time since the peer last sent anything.
    pub idle: Duration,
}

/// Receiver of status updates. Implementations must not block the caller.
pub trait StatusSink: Send + Sync {
    /// Accept a fresh snapshot.
    fn update(&self, snapshot: &StatusSnapshot);
}

/// Discards every snapshot.
#[derive(Debug, Default)]
pub struct NullStatus;

impl StatusSink for NullStatus {
    fn update(&self, _snapshot: &StatusSnapshot) {}
}

/// Logs a status line when the counters changed and enough time has passed.
#[derive(Debug)]
pub struct LogStatus {
    min_interval: Duration,
    state: Mutex<(Instant, u64, u64)>,
}

impl LogStatus {
    /// Sink logging at most once per `min_interval`.
    pub fn new(min_interval: Duration) -> Self {
        Self { min_interval, state: Mutex::new((Instant::now(), u64::MAX, u64::MAX)) }
    }
}

impl Default for LogStatus {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl StatusSink for LogStatus {
    fn update(&self, snapshot: &StatusSnapshot) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (ref mut last, ref mut in_seen, ref mut out_seen) = *state;
        let changed = snapshot.in_bytes != *in_seen || snapshot.out_bytes != *out_seen;
        if !changed || last.elapsed() < self.min_interval {
            return;
        }
        *last = Instant::now();
        *in_seen = snapshot.in_bytes;
        *out_seen = snapshot.out_bytes;

        let peer = snapshot
            .peer
            .as_ref()
            .map(|p| format!("{} v{}", p.role, p.version))
            .unwrap_or_else(|| "-".to_string());
        log::info!(
            "status: {:?} peer={} serial={} remote={} in={}B out={}B idle={}s",
            snapshot.phase,
            peer,
            snapshot.local_serial,
            snapshot.remote_serial.as_deref().unwrap_or("-"),
            snapshot.in_bytes,
            snapshot.out_bytes,
            snapshot.idle.as_secs(),
        );
    }
}
