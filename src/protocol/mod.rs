//! In-band control protocol.
//!
//! Control messages travel inside the data stream as ASCII tokens delimited
//! by the literal byte sequences `__#` and `#__`:
//!
//! ```text
//! __#GETVER#__              version request
//! __#BR_VER_0.0.70#__       version + role announcement
//! __#COM_PARAMS_COM3 9600 8N1N#__
//! ```
//!
//! [`ControlFrame`] is the decoded catalogue; [`TokenScanner`] (in `codec`)
//! separates frames from payload in an append-only byte stream. Everything
//! between frames is opaque payload and is relayed untouched.

mod codec;

pub use codec::{StreamEvent, TokenScanner, MAX_TOKEN_LEN};

use crate::serial::LineFormat;

/// Opening delimiter of a control frame.
pub const FRAME_START: &[u8] = b"__#";
/// Closing delimiter of a control frame.
pub const FRAME_END: &[u8] = b"#__";

/// Which role a peer announced in its version frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Listening endpoint that owns the served serial port.
    Server,
    /// Connecting endpoint that tunnels its own serial port.
    Bridge,
    /// Connecting endpoint backed by an interactive terminal.
    Client,
}

impl PeerRole {
    /// Wire prefix of this role's version token (`SRV_VER_` etc.).
    pub fn version_prefix(self) -> &'static str {
        match self {
            PeerRole::Server => "SRV_VER_",
            PeerRole::Bridge => "BR_VER_",
            PeerRole::Client => "CL_VER_",
        }
    }
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PeerRole::Server => "server",
            PeerRole::Bridge => "bridge",
            PeerRole::Client => "client",
        };
        write!(f, "{name}")
    }
}

/// Serial parameters as exchanged in a `COM_PARAMS` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireComParams {
    /// Port name as configured on the announcing side.
    pub port_name: String,
    /// Baud rate.
    pub baud: u32,
    /// Four-character line format (`8N1N`).
    pub line: LineFormat,
}

impl std::fmt::Display for WireComParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.port_name, self.baud, self.line)
    }
}

/// A decoded control frame.
///
/// `Unknown` preserves framing-valid tokens we do not recognise; the session
/// strips and ignores them (they never reach the serial endpoint).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlFrame {
    /// Ask the peer to announce its serial parameters.
    AskComParams,
    /// Announce own serial parameters.
    ComParams(WireComParams),
    /// Voluntary teardown; close on receipt.
    Disconnect,
    /// Liveness signal, no response required.
    Keepalive,
    /// Ask the peer to announce its version.
    GetVer,
    /// Version + implicit role announcement.
    Version {
        /// Announcing role, inferred from the token prefix.
        role: PeerRole,
        /// Dotted version string.
        version: String,
    },
    /// Ask the peer to announce its keep-alive interval.
    GetKaTimeout,
    /// Announce own keep-alive interval in seconds.
    MyKaTimeout(u64),
    /// Authentication material.
    Password(String),
    /// Authentication rejected.
    BadPassword,
    /// Policy-layer rejection.
    SecError,
    /// Policy-layer rejection (address blocked).
    IpBlocked,
    /// Framing-valid token with an unrecognised payload.
    Unknown(String),
}

impl ControlFrame {
    /// Decode the ASCII token between the delimiters.
    ///
    /// Never fails: unrecognised or non-UTF-8 tokens become [`Unknown`]
    /// (the framing already matched, so the bytes are stripped either way).
    ///
    /// [`Unknown`]: ControlFrame::Unknown
    pub fn parse(token: &[u8]) -> Self {
        let Ok(text) = std::str::from_utf8(token) else {
            return ControlFrame::Unknown(String::from_utf8_lossy(token).into_owned());
        };
        match text {
            "ASK_COM_PARAMS" => return ControlFrame::AskComParams,
            "DISCONNECT" => return ControlFrame::Disconnect,
            "KEEPALIVE" => return ControlFrame::Keepalive,
            "GETVER" => return ControlFrame::GetVer,
            "GET_KA_TIMEOUT" => return ControlFrame::GetKaTimeout,
            "BADPWD" => return ControlFrame::BadPassword,
            "SECERROR" => return ControlFrame::SecError,
            "IPBLOCKED" => return ControlFrame::IpBlocked,
            _ => {}
        }
        for role in [PeerRole::Server, PeerRole::Bridge, PeerRole::Client] {
            if let Some(version) = text.strip_prefix(role.version_prefix()) {
                return ControlFrame::Version { role, version: version.to_string() };
            }
        }
        if let Some(rest) = text.strip_prefix("MY_KA_TIMEOUT_") {
            if let Ok(seconds) = rest.parse::<u64>() {
                return ControlFrame::MyKaTimeout(seconds);
            }
        }
        if let Some(rest) = text.strip_prefix("COM_PARAMS_") {
            if let Some(params) = parse_com_params(rest) {
                return ControlFrame::ComParams(params);
            }
        }
        if let Some(secret) = text.strip_prefix("PWD_") {
            return ControlFrame::Password(secret.to_string());
        }
        ControlFrame::Unknown(text.to_string())
    }

    /// The ASCII token this frame encodes to (without delimiters).
    pub fn token(&self) -> String {
        match self {
            ControlFrame::AskComParams => "ASK_COM_PARAMS".to_string(),
            ControlFrame::ComParams(params) => format!("COM_PARAMS_{params}"),
            ControlFrame::Disconnect => "DISCONNECT".to_string(),
            ControlFrame::Keepalive => "KEEPALIVE".to_string(),
            ControlFrame::GetVer => "GETVER".to_string(),
            ControlFrame::Version { role, version } => {
                format!("{}{version}", role.version_prefix())
            }
            ControlFrame::GetKaTimeout => "GET_KA_TIMEOUT".to_string(),
            ControlFrame::MyKaTimeout(seconds) => format!("MY_KA_TIMEOUT_{seconds}"),
            ControlFrame::Password(secret) => format!("PWD_{secret}"),
            ControlFrame::BadPassword => "BADPWD".to_string(),
            ControlFrame::SecError => "SECERROR".to_string(),
            ControlFrame::IpBlocked => "IPBLOCKED".to_string(),
            ControlFrame::Unknown(token) => token.clone(),
        }
    }

    /// Encode this frame into delimited wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let token = self.token();
        let mut buf = Vec::with_capacity(FRAME_START.len() + token.len() + FRAME_END.len());
        buf.extend_from_slice(FRAME_START);
        buf.extend_from_slice(token.as_bytes());
        buf.extend_from_slice(FRAME_END);
        buf
    }
}

/// Parse `<portname> <baud> <line>` where the port name may itself contain
/// spaces; baud and line format are the last two space-separated fields.
fn parse_com_params(rest: &str) -> Option<WireComParams> {
    let mut fields = rest.rsplitn(3, ' ');
    let line: LineFormat = fields.next()?.parse().ok()?;
    let baud: u32 = fields.next()?.parse().ok()?;
    let port_name = fields.next()?.to_string();
    if port_name.is_empty() {
        return None;
    }
    Some(WireComParams { port_name, baud, line })
}
