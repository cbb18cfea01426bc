//! soe, a serial-over-Ethernet bridge.
//!
//! One binary, four roles: `server` listens and owns a serial endpoint,
//! `bridge` tunnels its own serial endpoint to a server, `client` attaches
//! a keyboard/screen to a server's endpoint, and `device` is a local
//! command-shell emulator for testing without hardware.

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use soe::config::{
    self, resolve_host, resolve_keepalive, resolve_logging, resolve_password, resolve_port,
    resolve_serial, resolve_tls, CommonArgs, EndpointArgs, FileConfig, SecurityArgs,
};
use soe::{bridge, client, device, logview, server};

#[derive(Parser, Debug)]
#[command(name = "soe", version, about = "Serial-over-Ethernet bridge")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for one peer at a time and serve a local serial endpoint.
    Server {
        /// Bind address (default 0.0.0.0).
        #[arg(long)]
        host: Option<String>,
        /// Listen port (default 7000).
        #[arg(long)]
        port: Option<u16>,
        #[command(flatten)]
        endpoint: EndpointArgs,
        #[command(flatten)]
        security: SecurityArgs,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Tunnel a local serial endpoint to a remote server.
    Bridge {
        /// Server host (default 127.0.0.1).
        #[arg(long)]
        host: Option<String>,
        /// Server port (default 7000).
        #[arg(long)]
        port: Option<u16>,
        /// Reconnect with back-off instead of exiting when the session ends.
        #[arg(long)]
        reconnect: bool,
        #[command(flatten)]
        endpoint: EndpointArgs,
        #[command(flatten)]
        security: SecurityArgs,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Interactive terminal against a remote server's serial endpoint.
    Client {
        /// Server host (default 127.0.0.1).
        #[arg(long)]
        host: Option<String>,
        /// Server port (default 7000).
        #[arg(long)]
        port: Option<u16>,
        #[command(flatten)]
        security: SecurityArgs,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Local device emulator (no network): a command shell behind a
    /// serial port, PTY, or named pipe.
    Device {
        #[command(flatten)]
        endpoint: EndpointArgs,
        #[command(flatten)]
        common: CommonArgs,
    },
    /// List serial ports visible to the operating system.
    ListPorts,
}

fn main() -> ExitCode {
    // Argument problems are startup failures: exit 1, not clap's default 2.
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
            let _ = e.print();
            return code;
        }
    };

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(cli: Cli) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match cli.command {
        Command::Server { host, port, endpoint, security, common } => {
            let file = FileConfig::load(common.cfgfile.as_ref())?;
            init_log_sinks(&common, &file)?;
            let cfg = config::ServerConfig {
                host: resolve_host(host.as_ref(), &file, config::DEFAULT_BIND),
                port: resolve_port(port.as_ref(), &file),
                serial: resolve_serial(&endpoint, &file)?,
                password: resolve_password(&security, &file),
                keepalive: resolve_keepalive(&common, &file, config::DEFAULT_KEEPALIVE_SERVER)?,
                tls: resolve_tls(&security, &file)?,
            };
            server::run(cfg, shutdown).await
        }
        Command::Bridge { host, port, reconnect, endpoint, security, common } => {
            let file = FileConfig::load(common.cfgfile.as_ref())?;
            init_log_sinks(&common, &file)?;
            let cfg = config::BridgeConfig {
                host: resolve_host(host.as_ref(), &file, config::DEFAULT_HOST),
                port: resolve_port(port.as_ref(), &file),
                serial: resolve_serial(&endpoint, &file)?,
                password: resolve_password(&security, &file),
                keepalive: resolve_keepalive(&common, &file, config::DEFAULT_KEEPALIVE_PEER)?,
                tls: resolve_tls(&security, &file)?,
                reconnect,
            };
            bridge::run(cfg, shutdown).await
        }
        Command::Client { host, port, security, common } => {
            let file = FileConfig::load(common.cfgfile.as_ref())?;
            init_log_sinks(&common, &file)?;
            let cfg = config::ClientConfig {
                host: resolve_host(host.as_ref(), &file, config::DEFAULT_HOST),
                port: resolve_port(port.as_ref(), &file),
                password: resolve_password(&security, &file),
                keepalive: resolve_keepalive(&common, &file, config::DEFAULT_KEEPALIVE_PEER)?,
                tls: resolve_tls(&security, &file)?,
            };
            client::run(cfg, shutdown).await
        }
        Command::Device { endpoint, common } => {
            let file = FileConfig::load(common.cfgfile.as_ref())?;
            init_log_sinks(&common, &file)?;
            let cfg = config::DeviceConfig { serial: resolve_serial(&endpoint, &file)? };
            device::run(cfg, shutdown).await
        }
        Command::ListPorts => {
            let ports = soe::serial::list_ports()?;
            if ports.is_empty() {
                println!("no serial ports found");
            }
            for (name, kind) in ports {
                println!("{name}\t{kind}");
            }
            Ok(())
        }
    }
}

fn init_log_sinks(common: &CommonArgs, file: &FileConfig) -> Result<()> {
    let logging = resolve_logging(common, file)?;
    if let Some(path) = logging.logfile {
        logview::init_file_sink(path, config::LOGFILE_MAX_BYTES, config::LOGFILE_ARCHIVES)?;
    }
    if let Some(mode) = logging.datalog {
        logview::init_transfer_sink(mode)?;
    }
    Ok(())
}

/// First interrupt asks sessions to disconnect cleanly; a second one exits
/// on the spot.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        log::info!("interrupt received, shutting down");
        shutdown.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("second interrupt, exiting immediately");
            std::process::exit(130);
        }
    });
}
