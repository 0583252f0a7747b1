//! riptide
//!
//! A non-blocking, single-threaded, callback-driven I/O runtime with an
//! HTTP/1.1 client and a recursive DNS stub resolver layered on top.
//!
//! # Features
//!
//! * Completion-based event loop over io_uring, kqueue or IOCP
//! * Timeouts, cancellation and multi-shot readiness polls
//! * DNS resolution on the wire with hosts-file fallback and TTL cache
//! * HTTP/1.1 with per-connection request queueing and chunked bodies
//! * HTTPS through a pluggable TLS provider
//!
//! # Architecture
//!
//! Everything runs on the thread driving [`aio::EventLoop::tick`].
//! `dns` and `http` are pure consumers of the `aio` submission API; the
//! TLS library is abstracted behind [`tls::Provider`].

/// The event-loop runtime
pub mod aio;

/// DNS resolution
pub mod dns;

/// HTTP/1.1 client
pub mod http;

/// Socket construction helpers
pub mod net;

/// Streaming line/byte scanner
pub mod scan;

/// TLS provider seam
pub mod tls;
