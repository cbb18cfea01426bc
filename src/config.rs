//! Configuration: CLI arguments, optional JSON config file, and the merge
//! between them.
//!
//! Every key has a documented default; explicit CLI values override file
//! values key by key. File lookup order:
//!
//! 1. `--cfgfile <path>` (error if unreadable)
//! 2. `$SOE_CONFIG_DIR/config.json`
//! 3. `<platform config dir>/soe/config.json` (e.g. `~/.config/soe/`)
//!
//! A missing file at steps 2–3 simply means defaults.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use serde::Deserialize;

use crate::logview::DumpMode;
use crate::net::tls::TlsMode;
use crate::serial::{LineFormat, SerialConfig};

/// Default TCP port.
pub const DEFAULT_PORT: u16 = 7000;
/// Default connect host for bridge and client.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default bind address for the server.
pub const DEFAULT_BIND: &str = "0.0.0.0";
/// Default baud rate.
pub const DEFAULT_BAUD: u32 = 9600;
/// Default keep-alive interval for the server role (seconds).
pub const DEFAULT_KEEPALIVE_SERVER: u64 = 120;
/// Default keep-alive interval for connecting roles (seconds).
pub const DEFAULT_KEEPALIVE_PEER: u64 = 30;
/// Log file rotation threshold.
pub const LOGFILE_MAX_BYTES: u64 = 1024 * 1024;
/// Archived log files kept after rotation.
pub const LOGFILE_ARCHIVES: usize = 5;

// ─── CLI argument groups ───────────────────────────────────────────────────

/// Local serial endpoint selection.
#[derive(Args, Debug, Clone, Default)]
pub struct EndpointArgs {
    /// Serial port name (device path; `COM*` names create a PTY on unix).
    #[arg(long)]
    pub comport: Option<String>,

    /// Serve a named pipe instead of a serial port (Windows only).
    #[arg(long, conflicts_with = "comport")]
    pub namedpipe: Option<String>,

    /// Baud rate (standard rates only).
    #[arg(long)]
    pub baud: Option<u32>,

    /// Line format: data bits, parity, stop bits, flow control (e.g. 8N1N).
    #[arg(long)]
    pub line: Option<String>,
}

/// Transport security and authentication.
#[derive(Args, Debug, Clone, Default)]
pub struct SecurityArgs {
    /// Enable TLS with an operator-supplied certificate (see --cert/--key).
    /// Peer certificates are never verified; --pwd is the authenticator.
    #[arg(long, conflicts_with = "secauto")]
    pub sec: bool,

    /// Enable TLS with an ephemeral self-signed certificate.
    #[arg(long)]
    pub secauto: bool,

    /// PEM certificate chain for --sec.
    #[arg(long, value_name = "PEM")]
    pub cert: Option<PathBuf>,

    /// PEM private key for --sec.
    #[arg(long, value_name = "PEM")]
    pub key: Option<PathBuf>,

    /// Shared session password.
    #[arg(long, value_name = "SECRET")]
    pub pwd: Option<String>,
}

/// Options common to every role.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Config file path (JSON).
    #[arg(long, value_name = "PATH")]
    pub cfgfile: Option<PathBuf>,

    /// Session log file (size-rotated, 1 MiB cap, 5 archives).
    #[arg(long, value_name = "PATH")]
    pub logfile: Option<PathBuf>,

    /// Dump relayed payload bytes: "ascii" or "hex".
    #[arg(long, value_name = "MODE")]
    pub datalog: Option<String>,

    /// Keep-alive interval in seconds (default: 120 server, 30 otherwise).
    #[arg(long, value_name = "SECONDS")]
    pub keepalive: Option<u64>,
}

// ─── Config file ───────────────────────────────────────────────────────────

/// JSON config file contents; every field optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Host to connect to (bridge/client) or bind (server).
    pub host: Option<String>,
    /// TCP port.
    pub port: Option<u16>,
    /// Serial port name.
    pub comport: Option<String>,
    /// Named pipe name.
    pub namedpipe: Option<String>,
    /// Baud rate.
    pub baud: Option<u32>,
    /// Line format string.
    pub line: Option<String>,
    /// Shared password.
    pub pwd: Option<String>,
    /// Auto-TLS toggle.
    pub secauto: Option<bool>,
    /// Custom TLS certificate path.
    pub cert: Option<PathBuf>,
    /// Custom TLS key path.
    pub key: Option<PathBuf>,
    /// Keep-alive interval seconds.
    pub keepalive: Option<u64>,
    /// Session log file path.
    pub logfile: Option<PathBuf>,
    /// Transfer dump mode: "ascii" or "hex".
    pub datalog: Option<String>,
}

impl FileConfig {
    /// Load per the documented lookup order.
    pub fn load(explicit: Option<&PathBuf>) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.clone(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    fn default_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var("SOE_CONFIG_DIR") {
            return Some(PathBuf::from(dir).join("config.json"));
        }
        dirs::config_dir().map(|dir| dir.join("soe").join("config.json"))
    }
}

// ─── Resolved per-role configs ─────────────────────────────────────────────

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Local serial endpoint.
    pub serial: SerialConfig,
    /// Required password, if any.
    pub password: Option<String>,
    /// Keep-alive interval seconds.
    pub keepalive: u64,
    /// TLS mode.
    pub tls: TlsMode,
}

/// Fully resolved bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Local serial endpoint.
    pub serial: SerialConfig,
    /// Password to present.
    pub password: Option<String>,
    /// Keep-alive interval seconds.
    pub keepalive: u64,
    /// TLS mode.
    pub tls: TlsMode,
    /// Reconnect with back-off instead of exiting when a session ends.
    pub reconnect: bool,
}

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server host.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Password to present.
    pub password: Option<String>,
    /// Keep-alive interval seconds.
    pub keepalive: u64,
    /// TLS mode.
    pub tls: TlsMode,
}

/// Fully resolved device emulator configuration.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Served endpoint.
    pub serial: SerialConfig,
}

/// Shared logging knobs, resolved once in `main`.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Rotating session log file, if any.
    pub logfile: Option<PathBuf>,
    /// Transfer dump mode, if enabled.
    pub datalog: Option<DumpMode>,
}

/// CLI wins, then file, then default.
fn pick<T: Clone>(cli: Option<&T>, file: Option<&T>, default: T) -> T {
    cli.or(file).cloned().unwrap_or(default)
}

/// Resolve the serial endpoint from CLI + file values.
///
/// `--namedpipe` takes precedence over `--comport` within the same source;
/// at least one must be present somewhere.
pub fn resolve_serial(endpoint: &EndpointArgs, file: &FileConfig) -> Result<SerialConfig> {
    let line: LineFormat = match endpoint.line.as_ref().or(file.line.as_ref()) {
        Some(text) => text.parse().map_err(|e: String| anyhow::anyhow!(e))?,
        None => LineFormat::default(),
    };
    let baud = pick(endpoint.baud.as_ref(), file.baud.as_ref(), DEFAULT_BAUD);

    if let Some(pipe) = endpoint.namedpipe.as_ref().or(file.namedpipe.as_ref()) {
        return Ok(SerialConfig::pipe(pipe.clone(), line));
    }
    let Some(port) = endpoint.comport.as_ref().or(file.comport.as_ref()) else {
        bail!("no serial endpoint configured: pass --comport or --namedpipe");
    };
    SerialConfig::new(port.clone(), baud, line).map_err(|e| anyhow::anyhow!(e))
}

/// Resolve the TLS mode from CLI + file values.
pub fn resolve_tls(security: &SecurityArgs, file: &FileConfig) -> Result<TlsMode> {
    let cert = security.cert.as_ref().or(file.cert.as_ref());
    let key = security.key.as_ref().or(file.key.as_ref());
    if security.sec || (cert.is_some() && key.is_some() && !security.secauto) {
        let (Some(cert), Some(key)) = (cert, key) else {
            bail!("--sec needs both --cert and --key");
        };
        return Ok(TlsMode::Custom { cert: cert.clone(), key: key.clone() });
    }
    if security.secauto || file.secauto.unwrap_or(false) {
        return Ok(TlsMode::Auto);
    }
    Ok(TlsMode::Off)
}

/// Resolve the logging knobs shared by all roles.
pub fn resolve_logging(common: &CommonArgs, file: &FileConfig) -> Result<LoggingConfig> {
    let datalog = match common.datalog.as_ref().or(file.datalog.as_ref()) {
        Some(text) => Some(text.parse::<DumpMode>().map_err(|e| anyhow::anyhow!(e))?),
        None => None,
    };
    Ok(LoggingConfig {
        logfile: common.logfile.as_ref().or(file.logfile.as_ref()).cloned(),
        datalog,
    })
}

/// Password from CLI or file.
pub fn resolve_password(security: &SecurityArgs, file: &FileConfig) -> Option<String> {
    security.pwd.clone().or_else(|| file.pwd.clone())
}

/// Keep-alive interval with a per-role default.
pub fn resolve_keepalive(common: &CommonArgs, file: &FileConfig, default: u64) -> Result<u64> {
    let value = pick(common.keepalive.as_ref(), file.keepalive.as_ref(), default);
    if value == 0 {
        bail!("--keepalive must be at least 1 second");
    }
    Ok(value)
}

/// Host with a per-role default (bind-all for the server, loopback else).
pub fn resolve_host(cli: Option<&String>, file: &FileConfig, default: &str) -> String {
    pick(cli, file.host.as_ref(), default.to_string())
}

/// TCP port.
pub fn resolve_port(cli: Option<&u16>, file: &FileConfig) -> u16 {
    pick(cli, file.port.as_ref(), DEFAULT_PORT)
}
