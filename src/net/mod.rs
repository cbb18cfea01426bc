//! TCP transport helpers.
//!
//! Plain TCP and TLS-wrapped streams both leave this module as [`BoxLink`],
//! so the session engine never knows which it got. TLS specifics live in
//! [`tls`].

pub mod tls;

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};

/// Upper bound on connection establishment.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connect to `host:port` with [`CONNECT_TIMEOUT`] and `TCP_NODELAY`.
///
/// Interactive byte streams want low latency, not batching.
pub async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let addr = format!("{host}:{port}");
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
        .await
        .with_context(|| format!("connecting to {addr} timed out"))?
        .with_context(|| format!("connecting to {addr}"))?;
    stream.set_nodelay(true).context("setting TCP_NODELAY")?;
    Ok(stream)
}

/// Bind the listening socket for the server role.
pub async fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    Ok(listener)
}

/// Accept one connection; the caller services it to completion before
/// accepting again (at most one peer per server instance).
pub async fn accept_one(listener: &TcpListener) -> Result<(TcpStream, SocketAddr)> {
    let (stream, peer) = listener.accept().await.context("accepting connection")?;
    stream.set_nodelay(true).context("setting TCP_NODELAY")?;
    Ok((stream, peer))
}
