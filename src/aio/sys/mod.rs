//! kernel backends: io_uring (Linux), kqueue (BSD/macOS), IOCP (Windows)
//!
//! The scheduling and dispatch loop is platform neutral; a backend only
//! moves operations into its kernel interface and reports raw results
//! back. Results use the io_uring convention: `>= 0` is the operation
//! result (count, descriptor, zero), `< 0` is a negated errno.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use slab::Slab;

use crate::aio::completion::{Completion, Token};

#[cfg(target_os = "linux")]
mod uring;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod kqueue;
#[cfg(windows)]
mod iocp;

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly",
    windows
)))]
compile_error!("no event loop backend for this target");

pub(crate) enum SubmitResult {
    /// Parked in the kernel; a completion will surface from `poll`.
    Queued,
    /// Finished synchronously with this raw result.
    Done(i32),
    /// The kernel submission queue is full; keep the op unqueued.
    Full,
}

pub(crate) trait Backend {
    fn submit(&mut self, token: Token, comp: &mut Completion) -> io::Result<SubmitResult>;

    /// Waits up to `wait` for kernel activity and appends raw
    /// completions. `None` blocks until at least one arrives.
    fn poll(
        &mut self,
        wait: Option<Duration>,
        pool: &mut Slab<Completion>,
        completed: &mut VecDeque<(Token, i32)>,
    ) -> io::Result<()>;

    /// Best-effort cancellation of a parked operation. The cancelled op
    /// still surfaces exactly one completion.
    fn cancel(&mut self, token: Token, comp: &mut Completion) -> io::Result<()>;
}

pub(crate) fn default_backend() -> io::Result<Box<dyn Backend>> {
    #[cfg(target_os = "linux")]
    return Ok(Box::new(uring::Uring::new()?));
    #[cfg(any(
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))]
    return Ok(Box::new(kqueue::Kqueue::new()?));
    #[cfg(windows)]
    return Ok(Box::new(iocp::Iocp::new()?));
}

#[cfg(unix)]
pub(crate) use attempt::{park_interest, perform, Attempt};

/// Eager non-blocking execution of an operation, shared by the readiness
/// backends and by the datagram send path on io_uring.
#[cfg(unix)]
mod attempt {
    use std::io;

    use crate::aio::completion::{Interest, Operation};
    use crate::net;

    pub(crate) enum Attempt {
        /// Raw result in the io_uring convention.
        Done(i32),
        /// The socket is not ready; park until `park_interest` readiness.
        WouldBlock,
    }

    fn errno() -> i32 {
        io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
    }

    fn ret(r: isize) -> Attempt {
        if r >= 0 {
            return Attempt::Done(r as i32);
        }
        match errno() {
            libc::EAGAIN => Attempt::WouldBlock,
            #[allow(unreachable_patterns)] // EWOULDBLOCK == EAGAIN on most targets
            libc::EWOULDBLOCK => Attempt::WouldBlock,
            err => Attempt::Done(-err),
        }
    }

    #[cfg(target_os = "linux")]
    const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
    #[cfg(not(target_os = "linux"))]
    const SEND_FLAGS: libc::c_int = 0;

    /// The readiness class an operation parks on when it would block.
    pub(crate) fn park_interest(op: &Operation) -> Interest {
        match op {
            Operation::Accept { .. } | Operation::Recv { .. } | Operation::Read { .. } => {
                Interest::Read
            }
            Operation::Poll { interest, .. } => *interest,
            _ => Interest::Write,
        }
    }

    pub(crate) fn perform(op: &mut Operation) -> Attempt {
        match op {
            Operation::Accept { sock, .. } => {
                let r = unsafe { libc::accept(*sock, std::ptr::null_mut(), std::ptr::null_mut()) };
                if r >= 0 {
                    if let Err(err) = net::set_nonblocking(r) {
                        log::warn!("accept: marking client non-blocking failed: {}", err);
                    }
                }
                ret(r as isize)
            }
            Operation::Close { sock } => ret(unsafe { libc::close(*sock) } as isize),
            Operation::Connect {
                sock,
                addr,
                initiated,
            } => {
                if !*initiated {
                    let r = unsafe { libc::connect(*sock, addr.as_ptr() as *const _, addr.len()) };
                    if r == 0 {
                        return Attempt::Done(0);
                    }
                    return match errno() {
                        libc::EINPROGRESS | libc::EALREADY | libc::EINTR => {
                            *initiated = true;
                            Attempt::WouldBlock
                        }
                        libc::EISCONN => Attempt::Done(0),
                        err => Attempt::Done(-err),
                    };
                }
                // writable after EINPROGRESS; the outcome is in SO_ERROR
                let mut so_error: libc::c_int = 0;
                let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
                let r = unsafe {
                    libc::getsockopt(
                        *sock,
                        libc::SOL_SOCKET,
                        libc::SO_ERROR,
                        &mut so_error as *mut _ as *mut libc::c_void,
                        &mut len,
                    )
                };
                if r < 0 {
                    Attempt::Done(-errno())
                } else if so_error == 0 {
                    Attempt::Done(0)
                } else if so_error == libc::EINPROGRESS || so_error == libc::EALREADY {
                    Attempt::WouldBlock
                } else {
                    Attempt::Done(-so_error)
                }
            }
            Operation::Read {
                fd,
                buf,
                offset,
                done,
                ..
            } => {
                let ptr = buf[*done..].as_mut_ptr() as *mut libc::c_void;
                let len = buf.len() - *done;
                let r = match offset {
                    Some(off) => unsafe {
                        libc::pread(*fd, ptr, len, (*off + *done as u64) as libc::off_t)
                    },
                    None => unsafe { libc::read(*fd, ptr, len) },
                };
                ret(r)
            }
            Operation::Write {
                fd,
                buf,
                offset,
                done,
                ..
            } => {
                let ptr = buf[*done..].as_ptr() as *const libc::c_void;
                let len = buf.len() - *done;
                let r = match offset {
                    Some(off) => unsafe {
                        libc::pwrite(*fd, ptr, len, (*off + *done as u64) as libc::off_t)
                    },
                    None => unsafe { libc::write(*fd, ptr, len) },
                };
                ret(r)
            }
            Operation::Recv { sock, buf } => {
                let r = unsafe {
                    libc::recv(*sock, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
                };
                ret(r)
            }
            Operation::Send {
                sock,
                buf,
                to,
                done,
                ..
            } => {
                let ptr = buf[*done..].as_ptr() as *const libc::c_void;
                let len = buf.len() - *done;
                let r = match to {
                    Some(addr) => unsafe {
                        libc::sendto(
                            *sock,
                            ptr,
                            len,
                            SEND_FLAGS,
                            addr.as_ptr() as *const _,
                            addr.len(),
                        )
                    },
                    None => unsafe { libc::send(*sock, ptr, len, SEND_FLAGS) },
                };
                ret(r)
            }
            Operation::Timeout { .. }
            | Operation::NextTick
            | Operation::Poll { .. }
            | Operation::PollRemove { .. } => {
                unreachable!("operation is handled outside the kernel")
            }
        }
    }
}
