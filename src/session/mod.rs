//! Session engine: handshake, authentication, keep-alive, and the byte pump.
//!
//! A single call to [`run_session`] drives a complete session over an
//! established network link and an open serial endpoint:
//!
//! ```text
//! run_session
//!  ├── net-read task (this fn)   socket → TokenScanner → dispatch/serial
//!  ├── serial-read task          serial → payload → writer channel
//!  ├── net-write task            writer channel → socket (frames + payload)
//!  ├── ticker task               KEEPALIVE + status snapshots
//!  └── auth watchdog             closes unauthenticated peers (server)
//! ```
//!
//! Every task selects against the session's `CancellationToken`; any
//! terminating condition (peer `DISCONNECT`, socket error, serial error,
//! SIGINT, auth failure) cancels it and the rest unwind within the read
//! timeout window. Payload never touches the serial endpoint before the
//! session is authorised, and control frames never touch it at all.

mod engine;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::link::BoxLink;
use crate::logview::{self, Direction, TransferDirection};
use crate::protocol::{ControlFrame, StreamEvent, TokenScanner};
use crate::serial::SerialConfig;
use crate::status::{StatusSink, StatusSnapshot};

pub use crate::protocol::PeerRole as Role;
pub(crate) use engine::{Engine, Verdict};

/// Grace period between sending `DISCONNECT` and closing the socket.
const SOFT_DISCONNECT_GRACE: Duration = Duration::from_millis(250);
/// Delay after `BADPWD` so the peer can read the reason before the close.
pub(crate) const BADPWD_GRACE: Duration = Duration::from_millis(300);
/// How long an accepted peer may take to authenticate.
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);
/// Fallback before a connecting role sends its introduction unprompted.
const INTRO_FALLBACK: Duration = Duration::from_millis(500);
/// Read buffer per pump direction.
const READ_BUF: usize = 4096;
/// Writer channel depth (frames and payload chunks).
const WRITER_DEPTH: usize = 64;

/// Session phase; transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// No connection yet.
    AwaitingConnect,
    /// Connection up, version/parameter exchange running.
    Handshake,
    /// Server is waiting for a correct `PWD_` frame.
    AwaitingAuth,
    /// Data plane open.
    Authorized,
    /// Teardown started.
    Disconnecting,
    /// Done.
    Closed,
}

/// What the peer announced about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Role inferred from the version frame prefix.
    pub role: Role,
    /// Announced version string.
    pub version: String,
}

/// Per-session configuration, assembled by the role drivers.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Local role.
    pub role: Role,
    /// Local serial endpoint description, announced in `COM_PARAMS`.
    pub serial: SerialConfig,
    /// Shared secret; `Some` on a server enforces authentication, `Some` on
    /// a connecting role is sent during the handshake.
    pub password: Option<String>,
    /// Local keep-alive interval in seconds.
    pub keepalive: u64,
}

impl SessionConfig {
    /// Wire version string announced by this role.
    pub fn local_version(&self) -> &'static str {
        match self.role {
            Role::Server => crate::SERVER_VERSION,
            Role::Bridge => crate::BRIDGE_VERSION,
            Role::Client => crate::CLIENT_VERSION,
        }
    }
}

/// Outcome of a completed session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Peer identity, if it announced one.
    pub peer: Option<PeerIdentity>,
    /// Wall-clock session duration.
    pub duration: Duration,
    /// Payload bytes written to the local serial endpoint.
    pub in_bytes: u64,
    /// Payload bytes read from the local serial endpoint.
    pub out_bytes: u64,
    /// Human-readable end cause.
    pub reason: &'static str,
}

/// State shared between the session tasks.
pub(crate) struct Shared {
    authorized: AtomicBool,
    in_bytes: AtomicU64,
    out_bytes: AtomicU64,
    last_activity: Mutex<Instant>,
    view: Mutex<View>,
}

struct View {
    phase: Phase,
    peer: Option<PeerIdentity>,
    remote_serial: Option<String>,
}

impl Shared {
    fn new(authorized: bool) -> Arc<Self> {
        Arc::new(Self {
            authorized: AtomicBool::new(authorized),
            in_bytes: AtomicU64::new(0),
            out_bytes: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            view: Mutex::new(View { phase: Phase::Handshake, peer: None, remote_serial: None }),
        })
    }

    pub(crate) fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::Relaxed)
    }

    pub(crate) fn authorize(&self) {
        self.authorized.store(true, Ordering::Relaxed);
        self.advance_phase(Phase::Authorized);
    }

    /// Move the phase forward; backward transitions are silently refused.
    pub(crate) fn advance_phase(&self, phase: Phase) {
        let mut view = self.lock_view();
        if phase > view.phase {
            view.phase = phase;
        }
    }

    pub(crate) fn set_peer(&self, peer: PeerIdentity) {
        self.lock_view().peer = Some(peer);
    }

    pub(crate) fn set_remote_serial(&self, desc: String) {
        self.lock_view().remote_serial = Some(desc);
    }

    pub(crate) fn touch(&self) {
        match self.last_activity.lock() {
            Ok(mut t) => *t = Instant::now(),
            Err(poisoned) => *poisoned.into_inner() = Instant::now(),
        }
    }

    fn idle(&self) -> Duration {
        match self.last_activity.lock() {
            Ok(t) => t.elapsed(),
            Err(poisoned) => poisoned.into_inner().elapsed(),
        }
    }

    fn lock_view(&self) -> std::sync::MutexGuard<'_, View> {
        match self.view.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn snapshot(&self, cfg: &SessionConfig) -> StatusSnapshot {
        let view = self.lock_view();
        StatusSnapshot {
            role: cfg.role,
            version: cfg.local_version(),
            peer: view.peer.clone(),
            local_serial: cfg.serial.to_string(),
            remote_serial: view.remote_serial.clone(),
            phase: view.phase,
            in_bytes: self.in_bytes.load(Ordering::Relaxed),
            out_bytes: self.out_bytes.load(Ordering::Relaxed),
            idle: self.idle(),
        }
    }
}

/// Drive one session to completion.
///
/// `link` is the established (possibly TLS-wrapped) network stream,
/// `endpoint` the open local serial endpoint. `shutdown` is the
/// process-wide stop token: cancelling it mid-session performs a soft
/// disconnect (`DISCONNECT`, brief grace, close).
pub async fn run_session(
    cfg: SessionConfig,
    link: BoxLink,
    endpoint: BoxLink,
    shutdown: CancellationToken,
    status: Arc<dyn StatusSink>,
) -> Result<SessionSummary> {
    let started = Instant::now();
    // A server without a password authorises at accept; everyone else flips
    // the flag later (server: correct PWD, connecting roles: intro sent).
    let shared = Shared::new(cfg.role == Role::Server && cfg.password.is_none());

    let cancel = CancellationToken::new();
    let soft = CancellationToken::new();
    let (net_tx, net_rx) = mpsc::channel::<Bytes>(WRITER_DEPTH);

    let (net_rd, net_wr) = tokio::io::split(link);
    let (serial_rd, serial_wr) = tokio::io::split(endpoint);

    let writer = tokio::spawn(net_write_task(net_wr, net_rx, cancel.clone()));
    let serial = tokio::spawn(serial_to_net_task(
        serial_rd,
        net_tx.clone(),
        shared.clone(),
        cancel.clone(),
        soft.clone(),
    ));
    let ticker = tokio::spawn(ticker_task(
        cfg.clone(),
        net_tx.clone(),
        shared.clone(),
        cancel.clone(),
        status,
    ));
    let watchdog = (cfg.role == Role::Server && cfg.password.is_some()).then(|| {
        let shared = shared.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => {}
                () = tokio::time::sleep(AUTH_TIMEOUT) => {
                    if !shared.is_authorized() {
                        logview::session_log(
                            log::Level::Warn,
                            Direction::System,
                            "peer did not authenticate in time, closing",
                        );
                        cancel.cancel();
                    }
                }
            }
        })
    });

    let mut engine = Engine::new(cfg.clone(), shared.clone(), net_tx.clone());
    engine.begin().await;

    let reason = net_read_loop(net_rd, serial_wr, &mut engine, &shared, &cancel, &soft, &shutdown)
        .await;

    shared.advance_phase(Phase::Closed);
    cancel.cancel();
    drop(engine);
    drop(net_tx);

    for mut handle in [Some(writer), Some(serial), Some(ticker), watchdog].into_iter().flatten() {
        if tokio::time::timeout(Duration::from_secs(1), &mut handle).await.is_err() {
            log::warn!("session task did not stop within a second, aborting it");
            handle.abort();
        }
    }

    let summary = SessionSummary {
        peer: shared.lock_view().peer.clone(),
        duration: started.elapsed(),
        in_bytes: shared.in_bytes.load(Ordering::Relaxed),
        out_bytes: shared.out_bytes.load(Ordering::Relaxed),
        reason,
    };
    logview::session_log(
        log::Level::Info,
        Direction::System,
        &format!(
            "session ended ({}) after {:.1}s, in {} B, out {} B",
            summary.reason,
            summary.duration.as_secs_f64(),
            summary.in_bytes,
            summary.out_bytes
        ),
    );
    Ok(summary)
}

/// Network reader: scans for control frames, dispatches them, forwards
/// payload to the serial endpoint. Also owns the soft-disconnect path.
async fn net_read_loop(
    mut net_rd: ReadHalf<BoxLink>,
    mut serial_wr: WriteHalf<BoxLink>,
    engine: &mut Engine,
    shared: &Arc<Shared>,
    cancel: &CancellationToken,
    soft: &CancellationToken,
    shutdown: &CancellationToken,
) -> &'static str {
    let mut scanner = TokenScanner::new();
    let mut buf = vec![0u8; READ_BUF];
    let intro_fallback = tokio::time::sleep(INTRO_FALLBACK);
    tokio::pin!(intro_fallback);

    'main: loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break 'main "cancelled",
            () = shutdown.cancelled() => {
                soft_disconnect(engine, shared, cancel).await;
                break 'main "local shutdown";
            }
            () = soft.cancelled() => {
                soft_disconnect(engine, shared, cancel).await;
                break 'main "local endpoint closed";
            }
            () = &mut intro_fallback, if !engine.intro_done() => {
                engine.send_intro().await;
            }
            read = net_rd.read(&mut buf) => {
                let n = match read {
                    Ok(0) => break 'main "peer closed connection",
                    Ok(n) => n,
                    Err(e) => {
                        logview::session_log(
                            log::Level::Error,
                            Direction::FromPeer,
                            &format!("network read failed: {e}"),
                        );
                        break 'main "network error";
                    }
                };
                shared.touch();
                for event in scanner.feed(&buf[..n]) {
                    match event {
                        StreamEvent::Payload(bytes) => {
                            if let Some(reason) =
                                deliver_payload(&mut serial_wr, shared, engine, &bytes).await
                            {
                                break 'main reason;
                            }
                        }
                        StreamEvent::Control(frame) => match engine.on_control(frame).await {
                            Verdict::Continue => {}
                            Verdict::PeerDisconnect => {
                                shared.advance_phase(Phase::Disconnecting);
                                break 'main "peer disconnected";
                            }
                            Verdict::Close(reason) => break 'main reason,
                        },
                    }
                }
            }
        }
    }
}

/// Write one payload run to the serial endpoint, enforcing the pre-auth
/// rules. Returns a session end reason on failure.
async fn deliver_payload(
    serial_wr: &mut WriteHalf<BoxLink>,
    shared: &Arc<Shared>,
    engine: &Engine,
    bytes: &Bytes,
) -> Option<&'static str> {
    if !shared.is_authorized() {
        if engine.role() == Role::Server {
            // An unauthenticated peer gets a plain close, no explanation.
            logview::session_log(
                log::Level::Warn,
                Direction::FromPeer,
                &format!("{} payload bytes before authorisation, closing", bytes.len()),
            );
            return Some("payload before authorisation");
        }
        log::debug!("dropping {} payload bytes received before authorisation", bytes.len());
        return None;
    }
    if let Err(e) = serial_wr.write_all(bytes).await {
        logview::session_log(
            log::Level::Error,
            Direction::System,
            &format!("serial write failed: {e}"),
        );
        return Some("serial write error");
    }
    shared.in_bytes.fetch_add(bytes.len() as u64, Ordering::Relaxed);
    logview::log_transfer(TransferDirection::In, bytes);
    None
}

/// Announce the teardown and give the writer a moment to flush it.
async fn soft_disconnect(engine: &Engine, shared: &Arc<Shared>, cancel: &CancellationToken) {
    shared.advance_phase(Phase::Disconnecting);
    logview::session_log(log::Level::Info, Direction::ToPeer, "disconnecting");
    engine.send_frame(&ControlFrame::Disconnect).await;
    tokio::time::sleep(SOFT_DISCONNECT_GRACE).await;
    cancel.cancel();
}

/// Serial reader: relays whatever the endpoint produces as raw payload.
///
/// Endpoint EOF requests a soft disconnect (the console endpoint reports
/// EOF on detach, a pipe on peer close); read errors tear the session down.
async fn serial_to_net_task(
    mut serial_rd: ReadHalf<BoxLink>,
    net_tx: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    soft: CancellationToken,
) {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            read = serial_rd.read(&mut buf) => match read {
                Ok(0) => {
                    soft.cancel();
                    return;
                }
                Ok(n) => {
                    if !shared.is_authorized() {
                        // Nothing may be forwarded yet; the bytes are lost by
                        // design (no buffering across the auth boundary).
                        continue;
                    }
                    shared.out_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    logview::log_transfer(TransferDirection::Out, &buf[..n]);
                    if net_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    logview::session_log(
                        log::Level::Error,
                        Direction::System,
                        &format!("serial read failed: {e}"),
                    );
                    cancel.cancel();
                    return;
                }
            }
        }
    }
}

/// Network writer: the only task that touches the socket's write half, so
/// control frames and payload serialise naturally.
async fn net_write_task(
    mut net_wr: WriteHalf<BoxLink>,
    mut net_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            chunk = net_rx.recv() => match chunk {
                Some(bytes) => {
                    if net_wr.write_all(&bytes).await.is_err() || net_wr.flush().await.is_err() {
                        cancel.cancel();
                        break;
                    }
                }
                None => break,
            },
            () = cancel.cancelled() => {
                // Flush whatever was already queued, then stop.
                while let Ok(bytes) = net_rx.try_recv() {
                    if net_wr.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                let _ = net_wr.flush().await;
                break;
            }
        }
    }
    let _ = net_wr.shutdown().await;
}

/// Keep-alive and status ticker.
async fn ticker_task(
    cfg: SessionConfig,
    net_tx: mpsc::Sender<Bytes>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    status: Arc<dyn StatusSink>,
) {
    let period = Duration::from_secs(cfg.keepalive.max(1));
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut refresh = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = keepalive.tick() => {
                if shared.is_authorized() {
                    let frame = Bytes::from(ControlFrame::Keepalive.encode());
                    if net_tx.send(frame).await.is_err() {
                        return;
                    }
                    log::debug!("[->peer] keepalive");
                }
            }
            _ = refresh.tick() => {
                status.update(&shared.snapshot(&cfg));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::LineFormat;

    fn cfg(role: Role, password: Option<&str>) -> SessionConfig {
        SessionConfig {
            role,
            serial: SerialConfig::new("T", 9600, LineFormat::default()).unwrap(),
            password: password.map(str::to_string),
            keepalive: 30,
        }
    }

    #[test]
    fn test_phase_transitions_are_forward_only() {
        let shared = Shared::new(false);
        shared.advance_phase(Phase::Authorized);
        assert_eq!(shared.lock_view().phase, Phase::Authorized);
        // A later attempt to fall back to an earlier phase is refused.
        shared.advance_phase(Phase::AwaitingAuth);
        assert_eq!(shared.lock_view().phase, Phase::Authorized);
        shared.advance_phase(Phase::Closed);
        assert_eq!(shared.lock_view().phase, Phase::Closed);
    }

    #[test]
    fn test_authorize_flips_flag_and_phase() {
        let shared = Shared::new(false);
        assert!(!shared.is_authorized());
        shared.authorize();
        assert!(shared.is_authorized());
        assert_eq!(shared.lock_view().phase, Phase::Authorized);
    }

    #[test]
    fn test_local_versions_per_role() {
        assert_eq!(cfg(Role::Server, None).local_version(), crate::SERVER_VERSION);
        assert_eq!(cfg(Role::Bridge, None).local_version(), crate::BRIDGE_VERSION);
        assert_eq!(cfg(Role::Client, None).local_version(), crate::CLIENT_VERSION);
    }

    #[test]
    fn test_snapshot_reflects_counters_and_peer() {
        let shared = Shared::new(true);
        shared.in_bytes.fetch_add(10, Ordering::Relaxed);
        shared.out_bytes.fetch_add(20, Ordering::Relaxed);
        shared.set_peer(PeerIdentity { role: Role::Bridge, version: "0.0.70".to_string() });
        shared.set_remote_serial("BR-A 9600 8N1N".to_string());

        let snapshot = shared.snapshot(&cfg(Role::Server, None));
        assert_eq!(snapshot.in_bytes, 10);
        assert_eq!(snapshot.out_bytes, 20);
        assert_eq!(snapshot.peer.unwrap().version, "0.0.70");
        assert_eq!(snapshot.remote_serial.as_deref(), Some("BR-A 9600 8N1N"));
        assert_eq!(snapshot.local_serial, "T 9600 8N1N");
    }
}
