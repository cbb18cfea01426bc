//! Client driver: interactive terminal session against a remote server.
//!
//! The keyboard becomes the "serial" input and stdout the output; the
//! session engine treats the console endpoint exactly like any serial port.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::link::BoxLink;
use crate::net::{self, tls::ClientTls};
use crate::serial::console::ConsoleEndpoint;
use crate::serial::{LineFormat, SerialConfig};
use crate::session::{self, Role, SessionConfig};
use crate::status::{NullStatus, StatusSink};

/// Run one interactive session.
pub async fn run(cfg: ClientConfig, shutdown: CancellationToken) -> Result<()> {
    let tls = ClientTls::from_mode(&cfg.tls).context("setting up TLS")?;

    let stream = net::connect_tcp(&cfg.host, cfg.port).await?;
    let link: BoxLink = match &tls {
        Some(tls) => tls.connect(&cfg.host, stream).await?,
        None => Box::new(stream),
    };

    println!(
        "soe client v{} connected to {}:{}; press Ctrl-] to disconnect",
        crate::CLIENT_VERSION,
        cfg.host,
        cfg.port
    );

    // Raw mode starts here and ends when the endpoint is dropped inside the
    // session teardown, so errors above stay readable.
    let endpoint: BoxLink = Box::new(ConsoleEndpoint::open());

    let session_cfg = SessionConfig {
        role: Role::Client,
        // Announced in COM_PARAMS so the peer sees something meaningful;
        // there is no real line underneath the keyboard.
        serial: SerialConfig {
            port_name: "console".to_string(),
            baud: crate::config::DEFAULT_BAUD,
            line: LineFormat::default(),
            named_pipe: false,
        },
        password: cfg.password.clone(),
        keepalive: cfg.keepalive,
    };
    // Status lines would scribble over the interactive stream.
    let status: Arc<dyn StatusSink> = Arc::new(NullStatus);

    let summary =
        session::run_session(session_cfg, link, endpoint, shutdown.clone(), status).await?;
    println!(
        "\r\ndisconnected ({}): {} B received, {} B sent",
        summary.reason, summary.in_bytes, summary.out_bytes
    );
    Ok(())
}
