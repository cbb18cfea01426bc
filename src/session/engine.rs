//! Control-frame dispatch and handshake sequencing.
//!
//! The engine is owned by the network-read task; it reacts to decoded
//! control frames and pushes replies into the shared writer channel. The
//! server opens with `GETVER` + `GET_KA_TIMEOUT`; connecting roles answer
//! those, then introduce themselves (`PWD_` if configured, `GETVER`,
//! `ASK_COM_PARAMS`) and open their data plane.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{PeerIdentity, Phase, Role, SessionConfig, Shared, BADPWD_GRACE};
use crate::logview::{self, Direction};
use crate::protocol::ControlFrame;

/// What the read loop should do after a dispatched frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Keep pumping.
    Continue,
    /// Peer sent `DISCONNECT`.
    PeerDisconnect,
    /// Close with the given reason.
    Close(&'static str),
}

pub(crate) struct Engine {
    cfg: SessionConfig,
    shared: Arc<Shared>,
    net_tx: mpsc::Sender<Bytes>,
    /// Whether we already announced our keep-alive interval.
    ka_announced: bool,
    /// The interval-mismatch warning fires once per session.
    ka_warned: bool,
    /// Connecting roles: introduction sent. Servers start done.
    intro_sent: bool,
}

impl Engine {
    pub(crate) fn new(cfg: SessionConfig, shared: Arc<Shared>, net_tx: mpsc::Sender<Bytes>) -> Self {
        let intro_sent = cfg.role == Role::Server;
        Self { cfg, shared, net_tx, ka_announced: false, ka_warned: false, intro_sent }
    }

    pub(crate) fn role(&self) -> Role {
        self.cfg.role
    }

    pub(crate) fn intro_done(&self) -> bool {
        self.intro_sent
    }

    /// Queue a frame for the writer task. Best-effort: a gone writer means
    /// the session is tearing down anyway.
    pub(crate) async fn send_frame(&self, frame: &ControlFrame) {
        log::debug!("[->peer] {}", frame.token());
        let _ = self.net_tx.send(Bytes::from(frame.encode())).await;
    }

    /// Role-specific opening moves, called once before the read loop.
    pub(crate) async fn begin(&mut self) {
        if self.cfg.role == Role::Server {
            self.send_frame(&ControlFrame::GetVer).await;
            self.send_frame(&ControlFrame::GetKaTimeout).await;
            if self.cfg.password.is_some() {
                self.shared.advance_phase(Phase::AwaitingAuth);
            }
        }
    }

    /// Connecting-role introduction: password, then our questions.
    ///
    /// Triggered after the server's opening frames are answered, or by the
    /// fallback timer against servers that ask nothing.
    pub(crate) async fn send_intro(&mut self) {
        if self.intro_sent {
            return;
        }
        self.intro_sent = true;
        if let Some(secret) = self.cfg.password.clone() {
            self.send_frame(&ControlFrame::Password(secret)).await;
        }
        self.send_frame(&ControlFrame::GetVer).await;
        self.send_frame(&ControlFrame::AskComParams).await;
        // From our side the session is now open; the server enforces its
        // own view and answers BADPWD if the secret was wrong.
        self.shared.authorize();
    }

    fn local_com_params(&self) -> ControlFrame {
        ControlFrame::ComParams(crate::protocol::WireComParams {
            port_name: self.cfg.serial.port_name.clone(),
            baud: self.cfg.serial.baud,
            line: self.cfg.serial.line,
        })
    }

    /// React to one decoded control frame.
    pub(crate) async fn on_control(&mut self, frame: ControlFrame) -> Verdict {
        self.shared.touch();
        match frame {
            ControlFrame::GetVer => {
                let reply = ControlFrame::Version {
                    role: self.cfg.role,
                    version: self.cfg.local_version().to_string(),
                };
                self.send_frame(&reply).await;
            }
            ControlFrame::Version { role, version } => {
                logview::session_log(
                    log::Level::Info,
                    Direction::FromPeer,
                    &format!("peer identified: {role} v{version}"),
                );
                self.shared.set_peer(PeerIdentity { role, version });
                if self.cfg.role == Role::Server && self.cfg.password.is_none() {
                    self.shared.advance_phase(Phase::Authorized);
                }
            }
            ControlFrame::GetKaTimeout => {
                self.send_frame(&ControlFrame::MyKaTimeout(self.cfg.keepalive)).await;
                self.ka_announced = true;
                self.send_intro().await;
            }
            ControlFrame::MyKaTimeout(seconds) => {
                if seconds > self.cfg.keepalive && !self.ka_warned {
                    self.ka_warned = true;
                    logview::session_log(
                        log::Level::Warn,
                        Direction::FromPeer,
                        &format!(
                            "peer keep-alive interval {seconds}s exceeds local {}s; \
                             a dead link may go unnoticed for that long",
                            self.cfg.keepalive
                        ),
                    );
                }
                if !self.ka_announced {
                    self.ka_announced = true;
                    self.send_frame(&ControlFrame::MyKaTimeout(self.cfg.keepalive)).await;
                }
                self.send_intro().await;
            }
            ControlFrame::AskComParams => {
                let reply = self.local_com_params();
                self.send_frame(&reply).await;
            }
            ControlFrame::ComParams(params) => {
                logview::session_log(
                    log::Level::Info,
                    Direction::FromPeer,
                    &format!("remote serial: {params}"),
                );
                if params.line != self.cfg.serial.line || params.baud != self.cfg.serial.baud {
                    logview::session_log(
                        log::Level::Warn,
                        Direction::System,
                        &format!(
                            "line parameters differ: local {} {}, remote {} {}",
                            self.cfg.serial.baud, self.cfg.serial.line, params.baud, params.line
                        ),
                    );
                }
                self.shared.set_remote_serial(params.to_string());
            }
            ControlFrame::Keepalive => {
                log::debug!("[peer->] keepalive");
            }
            ControlFrame::Password(secret) => return self.on_password(secret).await,
            ControlFrame::BadPassword => {
                logview::session_log(
                    log::Level::Error,
                    Direction::FromPeer,
                    "authorisation failed: server rejected the password",
                );
                return Verdict::Close("bad password");
            }
            ControlFrame::SecError => {
                logview::session_log(
                    log::Level::Error,
                    Direction::FromPeer,
                    "server reported a security error",
                );
                return Verdict::Close("security error");
            }
            ControlFrame::IpBlocked => {
                logview::session_log(
                    log::Level::Error,
                    Direction::FromPeer,
                    "server blocked this address",
                );
                return Verdict::Close("address blocked");
            }
            ControlFrame::Disconnect => {
                logview::session_log(log::Level::Info, Direction::FromPeer, "peer disconnecting");
                return Verdict::PeerDisconnect;
            }
            ControlFrame::Unknown(token) => {
                log::debug!("ignoring unknown control token {token:?}");
            }
        }
        Verdict::Continue
    }

    /// Server-side password check; other roles ignore stray `PWD_` frames.
    async fn on_password(&mut self, secret: String) -> Verdict {
        if self.cfg.role != Role::Server {
            log::debug!("ignoring PWD frame on a {} endpoint", self.cfg.role);
            return Verdict::Continue;
        }
        let Some(expected) = self.cfg.password.as_deref() else {
            // No password required; the peer volunteered one.
            return Verdict::Continue;
        };
        if secret == expected {
            logview::session_log(log::Level::Info, Direction::FromPeer, "peer authorised");
            self.shared.authorize();
            let params = self.local_com_params();
            self.send_frame(&params).await;
            self.send_frame(&ControlFrame::AskComParams).await;
            Verdict::Continue
        } else {
            logview::session_log(
                log::Level::Warn,
                Direction::FromPeer,
                "authorisation failed: wrong password",
            );
            self.send_frame(&ControlFrame::BadPassword).await;
            // Give the writer time to put BADPWD on the wire before the
            // close lands at the peer.
            tokio::time::sleep(BADPWD_GRACE).await;
            Verdict::Close("wrong password from peer")
        }
    }
}
