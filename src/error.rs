//! Error contract for serial endpoints.

use std::io;

/// Failure opening or driving a serial endpoint.
///
/// `Disconnected` is the only variant the pump treats as
/// terminal-but-recoverable (the session ends, the driver may reconnect);
/// every other variant is fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    /// The named port, pipe, or device does not exist.
    #[error("endpoint not found: {0}")]
    NotFound(String),

    /// Another process holds the endpoint.
    #[error("endpoint in use: {0}")]
    InUse(String),

    /// Insufficient permissions to open the endpoint.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The far side of the endpoint went away.
    #[error("endpoint disconnected")]
    Disconnected,

    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EndpointError {
    /// Classify a raw I/O error against an endpoint name.
    pub fn classify(err: io::Error, name: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(name.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(name.to_string()),
            io::ErrorKind::AddrInUse | io::ErrorKind::ResourceBusy => Self::InUse(name.to_string()),
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof => Self::Disconnected,
            _ => Self::Io(err),
        }
    }
}
