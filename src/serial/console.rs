//! Console endpoint for the client role.
//!
//! Keyboard bytes in, stdout bytes out, shaped like any other serial
//! endpoint so the pump and session engine need no special casing. The
//! terminal is switched to raw mode for the lifetime of the endpoint
//! (restored on drop, panics included) so keystrokes reach the remote side
//! exactly as pressed.
//!
//! On Windows the console delivers extended keys as out-of-band events
//! rather than bytes; these are translated to the equivalent ANSI escape
//! sequences (`ESC [ A` for up-arrow and so on) before transmission, so the
//! server-side consumer sees a uniform representation. On unix the terminal
//! already emits those sequences in raw mode and bytes pass through as-is.
//!
//! Ctrl-] detaches: the input thread stops, the endpoint reports EOF, and
//! the session performs a soft disconnect.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// Detach byte (Ctrl-], telnet style).
pub const DETACH_BYTE: u8 = 0x1D;

/// Restores the terminal on drop.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Option<Self> {
        match enable_raw_mode() {
            Ok(()) => Some(Self),
            Err(e) => {
                // Not a tty (piped stdin) is a supported mode; just pass bytes.
                log::debug!("raw mode unavailable: {e}");
                None
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Keyboard-in / stdout-out duplex link.
pub struct ConsoleEndpoint {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
    stdout: tokio::io::Stdout,
    _raw: Option<RawModeGuard>,
}

impl ConsoleEndpoint {
    /// Switch the terminal to raw mode and start the input thread.
    pub fn open() -> Self {
        let raw = RawModeGuard::enable();
        let (tx, rx) = mpsc::channel::<Vec<u8>>(32);
        spawn_input_thread(tx);
        Self { rx, pending: VecDeque::new(), stdout: tokio::io::stdout(), _raw: raw }
    }
}

impl AsyncRead for ConsoleEndpoint {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        if me.pending.is_empty() {
            match me.rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => me.pending.extend(bytes),
                // Input thread gone (EOF or detach): report end of stream.
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        while buf.remaining() > 0 {
            let Some(byte) = me.pending.pop_front() else { break };
            buf.put_slice(&[byte]);
        }
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ConsoleEndpoint {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stdout).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stdout).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for ConsoleEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleEndpoint").finish_non_exhaustive()
    }
}

/// Read keyboard input on a plain thread and forward byte chunks.
///
/// Dropping the sender ends the endpoint's read stream, which the session
/// turns into a soft disconnect.
fn spawn_input_thread(tx: mpsc::Sender<Vec<u8>>) {
    std::thread::Builder::new()
        .name("console-input".into())
        .spawn(move || {
            #[cfg(unix)]
            unix_input_loop(&tx);
            #[cfg(windows)]
            windows_input_loop(&tx);
        })
        .expect("spawning the console input thread cannot fail");
}

#[cfg(unix)]
fn unix_input_loop(tx: &mpsc::Sender<Vec<u8>>) {
    use std::io::Read;

    let mut stdin = std::io::stdin().lock();
    let mut buf = [0u8; 512];
    loop {
        let n = match stdin.read(&mut buf) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let chunk = &buf[..n];
        if let Some(at) = chunk.iter().position(|&b| b == DETACH_BYTE) {
            if at > 0 && tx.blocking_send(chunk[..at].to_vec()).is_err() {
                return;
            }
            log::info!("detach requested from keyboard");
            return;
        }
        if tx.blocking_send(chunk.to_vec()).is_err() {
            return;
        }
    }
}

#[cfg(windows)]
fn windows_input_loop(tx: &mpsc::Sender<Vec<u8>>) {
    use crossterm::event::{Event, KeyCode, KeyEventKind, KeyModifiers};

    loop {
        let event = match crossterm::event::read() {
            Ok(ev) => ev,
            Err(_) => return,
        };
        let Event::Key(key) = event else { continue };
        if key.kind == KeyEventKind::Release {
            continue;
        }
        if key.code == KeyCode::Char(']') && key.modifiers.contains(KeyModifiers::CONTROL) {
            log::info!("detach requested from keyboard");
            return;
        }
        let bytes = encode_key(key.code, key.modifiers);
        if !bytes.is_empty() && tx.blocking_send(bytes).is_err() {
            return;
        }
    }
}

/// Translate a decoded key into the byte sequence a raw unix terminal would
/// have produced, so both client platforms transmit identically.
#[cfg(any(windows, test))]
pub(crate) fn encode_key(
    code: crossterm::event::KeyCode,
    modifiers: crossterm::event::KeyModifiers,
) -> Vec<u8> {
    use crossterm::event::{KeyCode, KeyModifiers};

    match code {
        KeyCode::Char(c) if modifiers.contains(KeyModifiers::CONTROL) => {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() {
                vec![(upper as u8) & 0x1F]
            } else {
                c.to_string().into_bytes()
            }
        }
        KeyCode::Char(c) => c.to_string().into_bytes(),
        KeyCode::Enter => b"\r".to_vec(),
        KeyCode::Tab => b"\t".to_vec(),
        KeyCode::Backspace => vec![0x7F],
        KeyCode::Esc => vec![0x1B],
        KeyCode::Up => b"\x1b[A".to_vec(),
        KeyCode::Down => b"\x1b[B".to_vec(),
        KeyCode::Right => b"\x1b[C".to_vec(),
        KeyCode::Left => b"\x1b[D".to_vec(),
        KeyCode::Home => b"\x1b[H".to_vec(),
        KeyCode::End => b"\x1b[F".to_vec(),
        KeyCode::Insert => b"\x1b[2~".to_vec(),
        KeyCode::Delete => b"\x1b[3~".to_vec(),
        KeyCode::PageUp => b"\x1b[5~".to_vec(),
        KeyCode::PageDown => b"\x1b[6~".to_vec(),
        KeyCode::F(n @ 1..=4) => {
            vec![0x1B, b'O', b'P' + (n - 1)]
        }
        KeyCode::F(5) => b"\x1b[15~".to_vec(),
        KeyCode::F(n @ 6..=8) => format!("\x1b[1{}~", n + 1).into_bytes(),
        KeyCode::F(n @ 9..=10) => format!("\x1b[2{}~", n - 9).into_bytes(),
        KeyCode::F(11) => b"\x1b[23~".to_vec(),
        KeyCode::F(12) => b"\x1b[24~".to_vec(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossterm::event::{KeyCode, KeyModifiers};

    #[test]
    fn test_extended_keys_become_ansi_sequences() {
        assert_eq!(encode_key(KeyCode::Up, KeyModifiers::NONE), b"\x1b[A");
        assert_eq!(encode_key(KeyCode::Down, KeyModifiers::NONE), b"\x1b[B");
        assert_eq!(encode_key(KeyCode::Right, KeyModifiers::NONE), b"\x1b[C");
        assert_eq!(encode_key(KeyCode::Left, KeyModifiers::NONE), b"\x1b[D");
        assert_eq!(encode_key(KeyCode::Delete, KeyModifiers::NONE), b"\x1b[3~");
    }

    #[test]
    fn test_plain_and_control_chars() {
        assert_eq!(encode_key(KeyCode::Char('a'), KeyModifiers::NONE), b"a");
        assert_eq!(encode_key(KeyCode::Char('c'), KeyModifiers::CONTROL), vec![0x03]);
        assert_eq!(encode_key(KeyCode::Enter, KeyModifiers::NONE), b"\r");
        assert_eq!(encode_key(KeyCode::Backspace, KeyModifiers::NONE), vec![0x7F]);
    }

    #[test]
    fn test_function_keys() {
        assert_eq!(encode_key(KeyCode::F(1), KeyModifiers::NONE), b"\x1bOP");
        assert_eq!(encode_key(KeyCode::F(4), KeyModifiers::NONE), b"\x1bOS");
        assert_eq!(encode_key(KeyCode::F(5), KeyModifiers::NONE), b"\x1b[15~");
        assert_eq!(encode_key(KeyCode::F(12), KeyModifiers::NONE), b"\x1b[24~");
    }
}
