//! POSIX pseudo-terminal endpoint.
//!
//! When a `COM*` port name is requested on a unix host there is no such
//! device, so we fabricate one: open a PTY pair, publish the slave as a
//! symlink named after the requested port in the working directory, and hand
//! the master to the pump. External tools open `./COM1` like any tty.
//!
//! The slave is configured raw (no echo, no line discipline) and then
//! dropped; while no external client holds it open the master reports `EIO`,
//! which is treated as "no client attached": reads back off and retry,
//! writes are discarded. A successful read after `EIO` marks a client as
//! attached; the reverse transition is logged as a disconnect.

use std::fs::File;
use std::future::Future;
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, OpenptyResult, Winsize};
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, Termios};
use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::error::EndpointError;

/// Backoff between master reads while no client holds the slave open.
const NO_CLIENT_POLL: Duration = Duration::from_millis(100);

/// PTY master presented as an async duplex link, slave published as a
/// symlink. The symlink is removed on drop.
pub struct PtyEndpoint {
    master: AsyncFd<File>,
    slave_path: PathBuf,
    link_path: PathBuf,
    retry: Option<Pin<Box<Sleep>>>,
    client_attached: bool,
}

impl PtyEndpoint {
    /// Open a PTY pair and publish the slave as `./<name>`.
    pub fn create(name: &str) -> Result<Self, EndpointError> {
        let OpenptyResult { master, slave } =
            openpty(None::<&Winsize>, None::<&Termios>).map_err(nix_io)?;

        let slave_path = slave_name(&master)?;

        // Raw mode on the slave so bytes pass through verbatim.
        let mut termios = tcgetattr(&slave).map_err(nix_io)?;
        cfmakeraw(&mut termios);
        tcsetattr(&slave, SetArg::TCSANOW, &termios).map_err(nix_io)?;
        drop(slave);

        // Master must be non-blocking for AsyncFd.
        let flags = fcntl(master.as_raw_fd(), FcntlArg::F_GETFL).map_err(nix_io)?;
        fcntl(
            master.as_raw_fd(),
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .map_err(nix_io)?;

        let link_path = PathBuf::from(format!("./{name}"));
        publish_link(&slave_path, &link_path)?;

        let master = AsyncFd::new(File::from(master))?;
        log::info!("pty endpoint ready: {} -> {}", link_path.display(), slave_path.display());

        Ok(Self { master, slave_path, link_path, retry: None, client_attached: false })
    }

    /// Path of the real slave device.
    pub fn slave_path(&self) -> &Path {
        &self.slave_path
    }

    /// Path of the published symlink.
    pub fn link_path(&self) -> &Path {
        &self.link_path
    }

    fn note_eio(&mut self) {
        if self.client_attached {
            self.client_attached = false;
            log::info!("pty client disconnected from {}", self.link_path.display());
        }
    }
}

impl AsyncRead for PtyEndpoint {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = &mut *self;
        if let Some(sleep) = me.retry.as_mut() {
            ready!(sleep.as_mut().poll(cx));
            me.retry = None;
        }
        loop {
            let mut guard = ready!(me.master.poll_read_ready_mut(cx))?;
            let result = guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.read(buf.initialize_unfilled())
            });
            drop(guard);
            match result {
                Ok(Ok(n)) => {
                    if !me.client_attached {
                        me.client_attached = true;
                        log::info!("pty client attached to {}", me.link_path.display());
                    }
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(e)) if e.raw_os_error() == Some(nix::libc::EIO) => {
                    // No client holds the slave open. Back off instead of
                    // spinning on the persistent HUP readiness.
                    me.note_eio();
                    let mut sleep = Box::pin(tokio::time::sleep(NO_CLIENT_POLL));
                    match sleep.as_mut().poll(cx) {
                        Poll::Ready(()) => continue,
                        Poll::Pending => {
                            me.retry = Some(sleep);
                            return Poll::Pending;
                        }
                    }
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsyncWrite for PtyEndpoint {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = &mut *self;
        loop {
            let mut guard = ready!(me.master.poll_write_ready_mut(cx))?;
            let result = guard.try_io(|inner| {
                let mut file = inner.get_ref();
                file.write(data)
            });
            drop(guard);
            match result {
                Ok(Ok(n)) => return Poll::Ready(Ok(n)),
                Ok(Err(e)) if e.raw_os_error() == Some(nix::libc::EIO) => {
                    // No client attached: the bytes have nowhere to go.
                    me.note_eio();
                    return Poll::Ready(Ok(data.len()));
                }
                Ok(Err(e)) => return Poll::Ready(Err(e)),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

impl Drop for PtyEndpoint {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.link_path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("could not remove {}: {e}", self.link_path.display());
            }
        }
    }
}

impl std::fmt::Debug for PtyEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyEndpoint")
            .field("slave", &self.slave_path)
            .field("link", &self.link_path)
            .finish()
    }
}

/// Resolve the slave device path; ptsname must be called on the master fd.
fn slave_name<F: AsRawFd>(master: &F) -> Result<PathBuf, EndpointError> {
    // SAFETY: ptsname returns a pointer into static storage valid until the
    // next call; we copy it out immediately and never hold the pointer.
    let name = unsafe {
        let ptr = nix::libc::ptsname(master.as_raw_fd());
        if ptr.is_null() {
            return Err(EndpointError::Io(io::Error::last_os_error()));
        }
        std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
    };
    Ok(PathBuf::from(name))
}

/// Create the `./COMn` symlink, replacing a stale one from a previous run.
fn publish_link(target: &Path, link: &Path) -> Result<(), EndpointError> {
    match std::fs::symlink_metadata(link) {
        Ok(meta) if meta.file_type().is_symlink() => {
            std::fs::remove_file(link)?;
        }
        Ok(_) => {
            return Err(EndpointError::InUse(format!(
                "{} exists and is not a symlink",
                link.display()
            )));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(EndpointError::Io(e)),
    }
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

fn nix_io(errno: nix::errno::Errno) -> EndpointError {
    EndpointError::Io(io::Error::from(errno))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TEST_CWD_LOCK;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_symlink_published_and_removed() {
        let _cwd = TEST_CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let endpoint = PtyEndpoint::create("COMT1").unwrap();
        let link = endpoint.link_path().to_path_buf();
        assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        drop(endpoint);
        assert!(std::fs::symlink_metadata(&link).is_err());

        std::env::set_current_dir(prev).unwrap();
    }

    #[tokio::test]
    async fn test_bytes_cross_the_pty() {
        let _cwd = TEST_CWD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let dir = tempfile::tempdir().unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();

        let mut endpoint = PtyEndpoint::create("COMT2").unwrap();
        // Open the slave like an external client would, via the symlink.
        let mut client = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(endpoint.link_path())
            .unwrap();

        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        endpoint.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        endpoint.write_all(b"pong").await.unwrap();
        let mut back = [0u8; 4];
        client.read_exact(&mut back).unwrap();
        assert_eq!(&back, b"pong");

        drop(endpoint);
        std::env::set_current_dir(prev).unwrap();
    }
}
