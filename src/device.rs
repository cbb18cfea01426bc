//! Device emulator: a tiny interactive command shell behind a serial
//! endpoint, for exercising bridges and clients without real hardware.
//!
//! Owns a COM port, PTY, or named pipe and answers a small command set with
//! CRLF-terminated output. Input is echoed like a real line device,
//! including backspace and Ctrl-C line clearing. Purely local, no network.

use std::time::Instant;

use anyhow::{Context, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::DeviceConfig;
use crate::link::BoxLink;
use crate::logview::{self, Direction};

const PROMPT: &str = "device> ";

const HELP_TEXT: &str = "\
Available commands:\r\n\
  help, ?, h       Show this help\r\n\
  show version     Device version information\r\n\
  show clock       Current device time\r\n\
  show counters    Session byte counters and uptime\r\n\
  echo <text>      Echo text back\r\n\
  exit             End the session\r\n";

/// Run the emulator until `shutdown` fires.
///
/// When the peer goes away (pipe closed, `exit` typed) the endpoint is
/// reopened and the emulator waits for the next connection.
pub async fn run(cfg: DeviceConfig, shutdown: CancellationToken) -> Result<()> {
    logview::session_log(
        log::Level::Info,
        Direction::System,
        &format!("device emulator v{} serving {}", crate::DEVICE_VERSION, cfg.serial.port_name),
    );
    loop {
        let endpoint = crate::serial::open_endpoint(&cfg.serial)
            .await
            .with_context(|| format!("opening {}", cfg.serial.port_name))?;
        let stop = serve(endpoint, &shutdown).await?;
        if stop || shutdown.is_cancelled() {
            break;
        }
        logview::session_log(log::Level::Info, Direction::System, "session closed, reopening");
    }
    Ok(())
}

struct Counters {
    started: Instant,
    in_bytes: u64,
    out_bytes: u64,
}

/// Serve one endpoint lifetime. Returns `true` on process shutdown,
/// `false` when only the session ended.
async fn serve(mut endpoint: BoxLink, shutdown: &CancellationToken) -> Result<bool> {
    let mut counters = Counters { started: Instant::now(), in_bytes: 0, out_bytes: 0 };
    let mut line: Vec<u8> = Vec::new();
    let mut buf = [0u8; 256];

    send(&mut endpoint, &mut counters, &banner()).await?;
    send(&mut endpoint, &mut counters, PROMPT).await?;

    loop {
        let n = tokio::select! {
            () = shutdown.cancelled() => {
                let _ = send(&mut endpoint, &mut counters, "\r\nDevice shutting down.\r\n").await;
                return Ok(true);
            }
            read = endpoint.read(&mut buf) => match read {
                Ok(0) => return Ok(false),
                Ok(n) => n,
                Err(e) => {
                    logview::session_log(
                        log::Level::Warn,
                        Direction::System,
                        &format!("endpoint read failed: {e}"),
                    );
                    return Ok(false);
                }
            },
        };
        counters.in_bytes += n as u64;

        for &byte in &buf[..n] {
            match byte {
                b'\r' | b'\n' => {
                    send(&mut endpoint, &mut counters, "\r\n").await?;
                    let text = String::from_utf8_lossy(&line).trim().to_string();
                    line.clear();
                    match dispatch(&text, &counters) {
                        Reply::Text(output) => {
                            send(&mut endpoint, &mut counters, &output).await?;
                            send(&mut endpoint, &mut counters, PROMPT).await?;
                        }
                        Reply::Empty => send(&mut endpoint, &mut counters, PROMPT).await?,
                        Reply::Exit => {
                            send(&mut endpoint, &mut counters, "Bye.\r\n").await?;
                            return Ok(false);
                        }
                    }
                }
                0x08 | 0x7F => {
                    if line.pop().is_some() {
                        send(&mut endpoint, &mut counters, "\x08 \x08").await?;
                    }
                }
                0x03 => {
                    line.clear();
                    send(&mut endpoint, &mut counters, "^C\r\n").await?;
                    send(&mut endpoint, &mut counters, PROMPT).await?;
                }
                byte if (0x20..0x7F).contains(&byte) => {
                    line.push(byte);
                    send(&mut endpoint, &mut counters, std::str::from_utf8(&[byte]).unwrap_or(""))
                        .await?;
                }
                _ => {}
            }
        }
    }
}

enum Reply {
    Text(String),
    Empty,
    Exit,
}

fn banner() -> String {
    format!("\r\nsoe device emulator v{}\r\nType 'help' for available commands.\r\n", crate::DEVICE_VERSION)
}

/// The command table. Unknown input gets a pointer to `help`.
fn dispatch(input: &str, counters: &Counters) -> Reply {
    match input {
        "" => Reply::Empty,
        "help" | "?" | "h" => Reply::Text(HELP_TEXT.to_string()),
        "show version" => Reply::Text(format!(
            "soe device emulator\r\nVersion: {}\r\nPlatform: {}\r\n",
            crate::DEVICE_VERSION,
            std::env::consts::OS
        )),
        "show clock" => Reply::Text(format!(
            "{}\r\n",
            chrono::Local::now().format("%H:%M:%S%.3f %Z %a %b %e %Y")
        )),
        "show counters" => Reply::Text(format!(
            "Uptime: {}s\r\nBytes in: {}\r\nBytes out: {}\r\n",
            counters.started.elapsed().as_secs(),
            counters.in_bytes,
            counters.out_bytes
        )),
        "exit" | "quit" | "logout" => Reply::Exit,
        other => {
            if let Some(text) = other.strip_prefix("echo ") {
                Reply::Text(format!("{text}\r\n"))
            } else if other == "echo" {
                Reply::Text("\r\n".to_string())
            } else {
                Reply::Text(format!(
                    "% Unknown command: {other}\r\nType 'help' for available commands.\r\n"
                ))
            }
        }
    }
}

async fn send(endpoint: &mut BoxLink, counters: &mut Counters, text: &str) -> Result<()> {
    endpoint.write_all(text.as_bytes()).await.context("endpoint write")?;
    endpoint.flush().await.context("endpoint flush")?;
    counters.out_bytes += text.len() as u64;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters() -> Counters {
        Counters { started: Instant::now(), in_bytes: 0, out_bytes: 0 }
    }

    #[test]
    fn test_dispatch_help_aliases() {
        for cmd in ["help", "?", "h"] {
            let Reply::Text(text) = dispatch(cmd, &counters()) else {
                panic!("expected help text for {cmd}");
            };
            assert!(text.contains("show version"));
        }
    }

    #[test]
    fn test_dispatch_unknown_points_at_help() {
        let Reply::Text(text) = dispatch("reboot", &counters()) else {
            panic!("expected a reply");
        };
        assert!(text.starts_with("% Unknown command"));
    }

    #[test]
    fn test_dispatch_echo_and_exit() {
        let Reply::Text(text) = dispatch("echo hello there", &counters()) else {
            panic!("expected echo output");
        };
        assert_eq!(text, "hello there\r\n");
        assert!(matches!(dispatch("exit", &counters()), Reply::Exit));
        assert!(matches!(dispatch("", &counters()), Reply::Empty));
    }

    /// Drive a full session over an in-memory duplex link, the same shape a
    /// pipe or PTY endpoint presents.
    #[tokio::test]
    async fn test_serve_answers_help_over_a_link() {
        let (local, remote) = tokio::io::duplex(4096);
        let shutdown = CancellationToken::new();
        let server = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { serve(Box::new(local) as BoxLink, &shutdown).await }
        });

        let (mut rd, mut wr) = tokio::io::split(remote);
        wr.write_all(b"help\r").await.unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
        while !String::from_utf8_lossy(&collected).contains("echo <text>") {
            let n = tokio::time::timeout_at(deadline, rd.read(&mut buf)).await.unwrap().unwrap();
            assert!(n > 0, "endpoint closed early");
            collected.extend_from_slice(&buf[..n]);
        }
        let text = String::from_utf8_lossy(&collected);
        assert!(text.contains("soe device emulator"));
        assert!(text.contains("Available commands"));

        wr.write_all(b"exit\r").await.unwrap();
        let stopped = tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!stopped, "exit ends the session, not the process");
    }
}
