//! Type-erased duplex byte link.
//!
//! Serial endpoints (physical port, named pipe, PTY master, console) and the
//! network side (plain TCP, TLS) all reduce to "an async duplex byte stream".
//! The pump and session engine are written against this one alias so every
//! concrete transport plugs in unchanged.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything that can carry bytes both ways and be moved across tasks.
pub trait ByteLink: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteLink for T {}

/// Owned, type-erased duplex link.
pub type BoxLink = Box<dyn ByteLink>;
