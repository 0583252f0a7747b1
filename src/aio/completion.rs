//! completion records: one in-flight operation and its continuation

use std::io;
use std::net::SocketAddr;
use std::time::Instant;

use derive_more::{Display, Error};
use socket2::SockAddr;

use crate::aio::EventLoop;
use crate::net::RawSock;

/// Index of a [`Completion`] in the loop's pool. Doubles as the kernel
/// user-data for backends that carry one (io_uring, IOCP).
pub(crate) type Token = usize;

/// Token value reserved for kernel-side bookkeeping entries (cancel ops,
/// re-armed polls) that must never reach dispatch.
pub(crate) const RESERVED_TOKEN: Token = usize::MAX;

/// Errors surfaced by event-loop operations.
///
/// `WouldBlock` and `Interrupted` conditions are retried inside the loop
/// and never reach a user callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum AioError {
    ConnectionClosed,
    ConnectRefused,
    Timeout,
    PortRequired,
    HostUnreachable,
    Cancelled,
    Network(#[error(not(source))] io::ErrorKind),
}

impl AioError {
    #[cfg(unix)]
    pub(crate) fn from_errno(err: i32) -> AioError {
        match err {
            libc::ECONNREFUSED => AioError::ConnectRefused,
            libc::ETIMEDOUT => AioError::Timeout,
            libc::ECONNRESET | libc::ECONNABORTED | libc::EPIPE => AioError::ConnectionClosed,
            libc::EHOSTUNREACH | libc::ENETUNREACH => AioError::HostUnreachable,
            libc::ECANCELED => AioError::Cancelled,
            _ => AioError::Network(io::Error::from_raw_os_error(err).kind()),
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_errno(err: i32) -> AioError {
        AioError::from(io::Error::from_raw_os_error(err))
    }
}

impl From<io::Error> for AioError {
    fn from(err: io::Error) -> AioError {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => AioError::ConnectRefused,
            io::ErrorKind::TimedOut => AioError::Timeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => AioError::ConnectionClosed,
            io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => {
                AioError::HostUnreachable
            }
            kind => AioError::Network(kind),
        }
    }
}

/// Readiness class for [`EventLoop::poll`](crate::aio::EventLoop::poll).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// The operation half of a completion.
pub(crate) enum Operation {
    Accept {
        sock: RawSock,
        /// Set by backends that create the client socket up front
        /// (IOCP's AcceptEx); elsewhere the kernel result carries it.
        accepted: Option<RawSock>,
    },
    Close {
        sock: RawSock,
    },
    Connect {
        sock: RawSock,
        // boxed: backends hand the kernel a pointer into it and the
        // completion may move inside the pool while the op is in flight
        addr: Box<SockAddr>,
        initiated: bool,
    },
    Read {
        fd: RawSock,
        buf: Vec<u8>,
        offset: Option<u64>,
        done: usize,
        all: bool,
    },
    Write {
        fd: RawSock,
        buf: Vec<u8>,
        offset: Option<u64>,
        done: usize,
        all: bool,
    },
    Recv {
        sock: RawSock,
        buf: Vec<u8>,
    },
    Send {
        sock: RawSock,
        buf: Vec<u8>,
        to: Option<Box<SockAddr>>,
        done: usize,
        all: bool,
    },
    Timeout {
        expires: Instant,
        /// Companion timeouts guard another completion; `None` marks a
        /// plain user timeout.
        target: Option<Token>,
    },
    NextTick,
    Poll {
        fd: RawSock,
        interest: Interest,
        multi: bool,
    },
    PollRemove {
        target: Token,
    },
}

impl Operation {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Operation::Accept { .. } => "accept",
            Operation::Close { .. } => "close",
            Operation::Connect { .. } => "connect",
            Operation::Read { .. } => "read",
            Operation::Write { .. } => "write",
            Operation::Recv { .. } => "recv",
            Operation::Send { .. } => "send",
            Operation::Timeout { .. } => "timeout",
            Operation::NextTick => "next_tick",
            Operation::Poll { .. } => "poll",
            Operation::PollRemove { .. } => "poll_remove",
        }
    }
}

pub(crate) type AcceptCb = Box<dyn FnOnce(&mut EventLoop, Result<(RawSock, SocketAddr), AioError>)>;
pub(crate) type ConnectCb = Box<dyn FnOnce(&mut EventLoop, Result<RawSock, AioError>)>;
pub(crate) type IoCb = Box<dyn FnOnce(&mut EventLoop, Vec<u8>, Result<usize, AioError>)>;
pub(crate) type UnitCb = Box<dyn FnOnce(&mut EventLoop, Result<(), AioError>)>;
pub(crate) type PollCb = Box<dyn FnMut(&mut EventLoop, Result<(), AioError>)>;

/// The continuation half of a completion. Taken out of the record before
/// it runs so callbacks may freely resubmit against the loop.
pub(crate) enum Continuation {
    Accept(AcceptCb),
    Connect(ConnectCb),
    Io(IoCb),
    Unit(UnitCb),
    Poll(PollCb),
    /// Internal completions (companion timeouts, removals) with no user
    /// callback.
    None,
}

/// One in-flight operation, drawn from the loop's pool on submission and
/// returned to it after its continuation runs. Multi-shot polls persist
/// until removed.
pub(crate) struct Completion {
    pub op: Operation,
    pub cont: Continuation,
    pub in_kernel: bool,
    /// Companion timeout guarding this op, if any.
    pub timeout: Option<Token>,
    /// Error injected before kernel submission (timed-out sentinel,
    /// rejected endpoint). Delivered on next dispatch in place of the
    /// kernel result.
    pub forced: Option<AioError>,
    /// Set on companion timeouts once the guarded op has completed; the
    /// next timeout flush discards the entry without firing.
    pub cancelled: bool,
    /// Detached timeouts (cache maintenance) do not keep
    /// [`EventLoop::run`] alive.
    pub detached: bool,
}

impl Completion {
    pub(crate) fn new(op: Operation, cont: Continuation) -> Completion {
        Completion {
            op,
            cont,
            in_kernel: false,
            timeout: None,
            forced: None,
            cancelled: false,
            detached: false,
        }
    }
}
