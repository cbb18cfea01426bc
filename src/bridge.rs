//! Bridge driver: tunnel a local serial endpoint to a remote server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::link::BoxLink;
use crate::logview::{self, Direction};
use crate::net::{self, tls::ClientTls};
use crate::session::{self, Role, SessionConfig};
use crate::status::{LogStatus, StatusSink};

/// Back-off between reconnect attempts.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);

/// Run the bridge: connect, run one session, exit; or keep reconnecting
/// with a short back-off when `reconnect` is set.
pub async fn run(cfg: BridgeConfig, shutdown: CancellationToken) -> Result<()> {
    let tls = ClientTls::from_mode(&cfg.tls).context("setting up TLS")?;
    let status: Arc<dyn StatusSink> = Arc::new(LogStatus::default());

    loop {
        match run_once(&cfg, tls.as_ref(), &shutdown, &status).await {
            Ok(()) => {}
            Err(e) if cfg.reconnect => log::error!("session failed: {e:#}"),
            Err(e) => return Err(e),
        }
        if !cfg.reconnect || shutdown.is_cancelled() {
            break;
        }
        logview::session_log(
            log::Level::Info,
            Direction::System,
            &format!("reconnecting in {}s", RECONNECT_BACKOFF.as_secs()),
        );
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(RECONNECT_BACKOFF) => {}
        }
    }
    Ok(())
}

async fn run_once(
    cfg: &BridgeConfig,
    tls: Option<&ClientTls>,
    shutdown: &CancellationToken,
    status: &Arc<dyn StatusSink>,
) -> Result<()> {
    let endpoint = crate::serial::open_endpoint(&cfg.serial)
        .await
        .with_context(|| format!("opening serial endpoint {}", cfg.serial.port_name))?;

    let stream = net::connect_tcp(&cfg.host, cfg.port).await?;
    logview::session_log(
        log::Level::Info,
        Direction::System,
        &format!("bridge v{} connected to {}:{}", crate::BRIDGE_VERSION, cfg.host, cfg.port),
    );
    let link: BoxLink = match tls {
        Some(tls) => tls.connect(&cfg.host, stream).await?,
        None => Box::new(stream),
    };

    let session_cfg = SessionConfig {
        role: Role::Bridge,
        serial: cfg.serial.clone(),
        password: cfg.password.clone(),
        keepalive: cfg.keepalive,
    };
    session::run_session(session_cfg, link, endpoint, shutdown.clone(), status.clone()).await?;
    Ok(())
}
