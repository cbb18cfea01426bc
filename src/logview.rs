//! Session logging sinks.
//!
//! Three surfaces, all fire-and-forget from the pump's point of view:
//!
//! - [`session_log`]: direction-tagged session events, routed through the
//!   `log` facade (env_logger prints them) and teed to the optional
//!   rotating log file;
//! - [`init_file_sink`]: size-capped log file with N archived rotations,
//!   written by its own thread behind a bounded channel (full channel drops
//!   the line, the pump is never back-pressured);
//! - [`log_transfer`]: optional ascii/hex dump of relayed payload, same
//!   drop-on-overflow policy.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::OnceLock;

use anyhow::{Context, Result};

/// Which way an event travelled, from the local endpoint's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Emitted by us towards the peer.
    ToPeer,
    /// Received from the peer.
    FromPeer,
    /// Local machinery, no peer involved.
    System,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Direction::ToPeer => "->peer",
            Direction::FromPeer => "peer->",
            Direction::System => "sys",
        };
        write!(f, "{tag}")
    }
}

/// Payload travel direction for the transfer dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    /// Network to serial.
    In,
    /// Serial to network.
    Out,
}

/// Rendering mode for the transfer dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    /// Printable characters as-is, the rest escaped.
    Ascii,
    /// Two-digit hex, space separated.
    Hex,
}

impl std::str::FromStr for DumpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ascii" => Ok(DumpMode::Ascii),
            "hex" => Ok(DumpMode::Hex),
            other => Err(format!("dump mode must be ascii or hex, got {other:?}")),
        }
    }
}

struct FileSink {
    tx: SyncSender<String>,
}

struct TransferSink {
    tx: SyncSender<(TransferDirection, Vec<u8>)>,
}

static FILE_SINK: OnceLock<FileSink> = OnceLock::new();
static TRANSFER_SINK: OnceLock<TransferSink> = OnceLock::new();

/// Log a session event with its direction, teeing to the file sink if one
/// is configured. Never blocks.
pub fn session_log(level: log::Level, dir: Direction, text: &str) {
    log::log!(level, "[{dir}] {text}");
    if let Some(sink) = FILE_SINK.get() {
        let line = format!(
            "{} {:5} [{dir}] {text}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level
        );
        // Full or gone: the line is dropped, never the pump stalled.
        let _ = sink.tx.try_send(line);
    }
}

/// Start the rotating file sink. Call at most once, before any sessions.
///
/// When the file grows past `max_bytes` it is rotated to `<path>.1`,
/// shifting existing archives up and discarding the oldest beyond
/// `max_archives`.
pub fn init_file_sink(path: PathBuf, max_bytes: u64, max_archives: usize) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening log file {}", path.display()))?;

    let (tx, rx) = sync_channel::<String>(256);
    std::thread::Builder::new()
        .name("log-file".into())
        .spawn(move || {
            let mut writer = RotatingWriter { path, file, max_bytes, max_archives };
            while let Ok(line) = rx.recv() {
                writer.write_line(&line);
            }
        })
        .context("spawning the log writer thread")?;

    FILE_SINK.set(FileSink { tx }).ok();
    Ok(())
}

struct RotatingWriter {
    path: PathBuf,
    file: File,
    max_bytes: u64,
    max_archives: usize,
}

impl RotatingWriter {
    fn write_line(&mut self, line: &str) {
        if self.file.write_all(line.as_bytes()).is_err() {
            return;
        }
        let size = self.file.metadata().map(|m| m.len()).unwrap_or(0);
        if size >= self.max_bytes {
            self.rotate();
        }
    }

    fn rotate(&mut self) {
        let archive = |n: usize| PathBuf::from(format!("{}.{n}", self.path.display()));
        let _ = std::fs::remove_file(archive(self.max_archives));
        for n in (1..self.max_archives).rev() {
            let _ = std::fs::rename(archive(n), archive(n + 1));
        }
        let _ = std::fs::rename(&self.path, archive(1));
        if let Ok(fresh) = OpenOptions::new().create(true).append(true).open(&self.path) {
            self.file = fresh;
        }
    }
}

/// Start the transfer dump sink. Call at most once.
pub fn init_transfer_sink(mode: DumpMode) -> Result<()> {
    let (tx, rx) = sync_channel::<(TransferDirection, Vec<u8>)>(256);
    std::thread::Builder::new()
        .name("transfer-dump".into())
        .spawn(move || {
            while let Ok((dir, bytes)) = rx.recv() {
                let tag = match dir {
                    TransferDirection::In => "<<",
                    TransferDirection::Out => ">>",
                };
                log::debug!(target: "transfer", "{tag} {}", render(&bytes, mode));
            }
        })
        .context("spawning the transfer dump thread")?;
    TRANSFER_SINK.set(TransferSink { tx }).ok();
    Ok(())
}

/// Record relayed payload bytes. Cheap no-op unless the sink is active;
/// drops on overflow rather than stalling the relay.
pub fn log_transfer(dir: TransferDirection, bytes: &[u8]) {
    if let Some(sink) = TRANSFER_SINK.get() {
        let _ = sink.tx.try_send((dir, bytes.to_vec()));
    }
}

fn render(bytes: &[u8], mode: DumpMode) -> String {
    match mode {
        DumpMode::Hex => bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(" "),
        DumpMode::Ascii => bytes
            .iter()
            .map(|&b| {
                if (0x20..0x7f).contains(&b) {
                    (b as char).to_string()
                } else {
                    format!("\\x{b:02x}")
                }
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_hex() {
        assert_eq!(render(&[0x00, 0xff, 0x41], DumpMode::Hex), "00 ff 41");
    }

    #[test]
    fn test_render_ascii_escapes_non_printable() {
        assert_eq!(render(b"ok\r\n", DumpMode::Ascii), "ok\\x0d\\x0a");
    }

    #[test]
    fn test_rotation_shifts_archives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.log");
        let file = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        let mut writer = RotatingWriter { path: path.clone(), file, max_bytes: 32, max_archives: 2 };

        for i in 0..8 {
            writer.write_line(&format!("line number {i} padding padding\n"));
        }

        assert!(path.exists());
        assert!(PathBuf::from(format!("{}.1", path.display())).exists());
        // Never more archives than configured.
        assert!(!PathBuf::from(format!("{}.3", path.display())).exists());
    }
}
