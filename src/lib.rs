//! Serial-over-Ethernet bridge library.
//!
//! Three cooperating roles tunnel raw byte streams between serial endpoints
//! across TCP, optionally under TLS, authenticated by a shared password:
//!
//! ```text
//! [local serial] ⇄ pump ⇄ session ⇄ codec ⇄ tls ⇄ TCP ⇄ ... ⇄ [remote serial]
//! ```
//!
//! - `server` listens, owns a local serial endpoint, serves one peer at a time
//! - `bridge` connects and tunnels its own local serial endpoint to the server
//! - `client` connects and maps the operator's keyboard/screen to the server's
//!   serial endpoint
//!
//! The binary in `main.rs` selects the role; everything else lives here so
//! integration tests can drive the session engine directly.

pub mod bridge;
pub mod client;
pub mod config;
pub mod device;
pub mod error;
pub mod link;
pub mod logview;
pub mod net;
pub mod protocol;
pub mod serial;
pub mod server;
pub mod session;
pub mod status;

// Re-export commonly used types
pub use config::{BridgeConfig, ClientConfig, DeviceConfig, ServerConfig};
pub use error::EndpointError;
pub use link::{BoxLink, ByteLink};
pub use protocol::{ControlFrame, PeerRole, StreamEvent, TokenScanner};
pub use serial::{LineFormat, SerialConfig};
pub use session::{Role, SessionConfig, SessionSummary};

/// Wire-visible protocol version announced by the server role.
pub const SERVER_VERSION: &str = "0.0.53";
/// Wire-visible protocol version announced by the bridge role.
pub const BRIDGE_VERSION: &str = "0.0.70";
/// Wire-visible protocol version announced by the client role.
pub const CLIENT_VERSION: &str = "0.0.56";
/// Version of the auxiliary device emulator.
pub const DEVICE_VERSION: &str = "0.0.1";

/// The working directory is process-global; tests that relocate it (PTY
/// symlinks, ephemeral certificates) serialise on this lock.
#[cfg(test)]
pub(crate) static TEST_CWD_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
