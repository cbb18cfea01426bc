//! Windows named-pipe endpoint.
//!
//! The role that owns the virtual port creates the pipe (one instance,
//! duplex, message mode) and waits for a peer to connect; external tools
//! open it like a file. Short names get the OS namespace prefix applied
//! here, so configs just say `--namedpipe mydevice`.

use tokio::net::windows::named_pipe::{PipeMode, ServerOptions};

use crate::error::EndpointError;
use crate::link::BoxLink;

/// Expand a bare pipe name into the OS namespace.
fn pipe_path(name: &str) -> String {
    if name.starts_with(r"\\") {
        name.to_string()
    } else {
        format!(r"\\.\pipe\{name}")
    }
}

/// Create the pipe as its owner and wait for one client to connect.
pub async fn open_owned(name: &str) -> Result<BoxLink, EndpointError> {
    let path = pipe_path(name);
    let server = ServerOptions::new()
        .first_pipe_instance(true)
        .max_instances(1)
        .pipe_mode(PipeMode::Message)
        .create(&path)
        .map_err(|e| EndpointError::classify(e, &path))?;

    log::info!("named pipe created: {path}, waiting for peer");
    server.connect().await.map_err(|e| EndpointError::classify(e, &path))?;
    log::info!("named pipe peer connected: {path}");

    Ok(Box::new(server))
}
