//! Server driver: sequential accept loop, one session at a time.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::link::BoxLink;
use crate::logview::{self, Direction};
use crate::net::{self, tls::ServerTls};
use crate::session::{self, Role, SessionConfig};
use crate::status::{LogStatus, StatusSink};

/// Run the server until `shutdown` fires.
///
/// At most one peer is serviced at a time; while a session runs, further
/// connection attempts wait in the listen backlog. Each accept gets a fresh
/// session state and a freshly opened serial endpoint, and the loop resumes
/// accepting as soon as the previous session has quiesced.
pub async fn run(cfg: ServerConfig, shutdown: CancellationToken) -> Result<()> {
    let tls = ServerTls::from_mode(&cfg.tls).context("setting up TLS")?;
    let listener = net::bind_listener(&cfg.host, cfg.port).await?;
    logview::session_log(
        log::Level::Info,
        Direction::System,
        &format!(
            "server v{} listening on {}:{} (tls: {}, auth: {})",
            crate::SERVER_VERSION,
            cfg.host,
            cfg.port,
            if tls.is_some() { "on" } else { "off" },
            if cfg.password.is_some() { "password" } else { "open" },
        ),
    );
    let status: Arc<dyn StatusSink> = Arc::new(LogStatus::default());

    loop {
        let (stream, peer_addr) = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = net::accept_one(&listener) => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    log::error!("accept failed: {e:#}");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            },
        };
        logview::session_log(
            log::Level::Info,
            Direction::System,
            &format!("peer connected from {peer_addr}"),
        );

        let link: BoxLink = match &tls {
            Some(tls) => match tls.accept(stream).await {
                Ok(link) => link,
                Err(e) => {
                    log::error!("TLS handshake with {peer_addr} failed: {e:#}");
                    continue;
                }
            },
            None => Box::new(stream),
        };

        let endpoint = match crate::serial::open_endpoint(&cfg.serial).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                log::error!("opening serial endpoint {}: {e}", cfg.serial.port_name);
                continue;
            }
        };

        let session_cfg = SessionConfig {
            role: Role::Server,
            serial: cfg.serial.clone(),
            password: cfg.password.clone(),
            keepalive: cfg.keepalive,
        };
        match session::run_session(session_cfg, link, endpoint, shutdown.clone(), status.clone())
            .await
        {
            Ok(_summary) => {}
            Err(e) => log::error!("session with {peer_addr} failed: {e:#}"),
        }
        // Back to accepting; a failed session never takes the server down.
    }

    logview::session_log(log::Level::Info, Direction::System, "server shut down");
    Ok(())
}
