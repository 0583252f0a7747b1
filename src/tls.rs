//! the TLS seam consumed by the HTTP client
//!
//! The crate never names a TLS library. An application hands
//! [`HttpClient`](crate::http::HttpClient) a [`Provider`]; the client
//! creates one [`Session`] per HTTPS connection and drives WantRead /
//! WantWrite through event-loop readiness polls.

use std::io;

use crate::net::RawSock;

/// Outcome of a TLS operation on a non-blocking socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsStatus {
    /// The operation finished.
    Done,
    /// Blocked until the socket is readable.
    WantRead,
    /// Blocked until the socket is writable.
    WantWrite,
    /// The peer started an orderly TLS shutdown.
    Shutdown,
    /// The session is broken and must be discarded.
    Fatal,
}

/// One TLS session bound to one socket.
pub trait Session {
    /// Advances the handshake by one step.
    fn connect(&mut self) -> TlsStatus;

    /// Encrypts and writes from `bytes`, returning how much was
    /// consumed. Zero with [`TlsStatus::Done`] means no progress.
    fn send(&mut self, bytes: &[u8]) -> (usize, TlsStatus);

    /// Reads and decrypts into `buf`. Zero with [`TlsStatus::Done`]
    /// means the stream ended cleanly.
    fn recv(&mut self, buf: &mut [u8]) -> (usize, TlsStatus);
}

/// Factory for sessions; one per [`HttpClient`](crate::http::HttpClient).
pub trait Provider {
    /// Creates a session over an already-connected socket. `host` is
    /// the name to verify and send as SNI.
    fn session(&self, socket: RawSock, host: &str) -> io::Result<Box<dyn Session>>;
}
