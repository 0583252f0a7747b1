//! the event loop proper: submission API, timeouts, dispatch
//!
//! One tick flushes expired timeouts, pushes unqueued submissions to the
//! kernel, drains kernel completions and dispatches callbacks. All
//! callbacks run on the thread calling [`EventLoop::tick`]; an operation
//! submitted here fires its callback exactly once.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::time::{Duration, Instant};

use slab::Slab;

use crate::aio::completion::{AioError, Completion, Continuation, Interest, Operation, Token};
use crate::aio::sys::{self, Backend, SubmitResult};
use crate::net::{self, RawSock};

/// Handle to a registered poll; required to remove a multi-shot poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollHandle(pub(crate) Token);

#[cfg(unix)]
fn transparent_retry(err: i32) -> bool {
    err == libc::EAGAIN || err == libc::EWOULDBLOCK || err == libc::EINTR
}

#[cfg(windows)]
fn transparent_retry(err: i32) -> bool {
    use windows_sys::Win32::Networking::WinSock::{WSAEINTR, WSAEWOULDBLOCK};
    err == WSAEWOULDBLOCK || err == WSAEINTR
}

pub struct EventLoop {
    backend: Box<dyn Backend>,
    pool: Slab<Completion>,
    /// Reported by the kernel (or synchronously) and awaiting dispatch.
    completed: VecDeque<(Token, i32)>,
    /// Accepted by `submit` but not yet in the kernel (queue was full).
    unqueued: VecDeque<Token>,
    /// Unordered timeout completions, scanned each tick.
    timeouts: Vec<Token>,
    io_inflight: usize,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        Ok(EventLoop {
            backend: sys::default_backend()?,
            pool: Slab::with_capacity(64),
            completed: VecDeque::new(),
            unqueued: VecDeque::new(),
            timeouts: Vec::new(),
            io_inflight: 0,
        })
    }

    /// True when no submitted work remains: nothing in the kernel,
    /// nothing queued, no pending timeouts, nothing to dispatch.
    /// Detached timeouts do not count.
    pub fn is_idle(&self) -> bool {
        self.completed.is_empty()
            && self.unqueued.is_empty()
            && self.io_inflight == 0
            && self
                .timeouts
                .iter()
                .all(|&token| self.pool.get(token).map_or(true, |comp| comp.detached))
    }

    /// Runs ticks until the loop is idle.
    pub fn run(&mut self) -> io::Result<()> {
        while !self.is_idle() {
            self.tick(None)?;
        }
        Ok(())
    }

    /// One pass: flush timeouts, flush submissions, drain the kernel
    /// (waiting at most `wait`, bounded further by the nearest timeout),
    /// dispatch callbacks. `None` waits until kernel activity or the
    /// nearest timeout.
    pub fn tick(&mut self, wait: Option<Duration>) -> io::Result<()> {
        let ceiling = self.flush_timeouts();
        self.flush_submissions();

        let wait = if !self.completed.is_empty() {
            Some(Duration::ZERO)
        } else {
            match (wait, ceiling) {
                (Some(w), Some(c)) => Some(w.min(c)),
                (None, c) => c,
                (w, None) => w,
            }
        };
        self.drain_kernel(wait)?;
        self.dispatch();
        Ok(())
    }

    // ---- submission API ----------------------------------------------

    /// Accepts one connection from a listening socket. The accepted
    /// socket is non-blocking.
    pub fn accept(
        &mut self,
        sock: RawSock,
        cb: impl FnOnce(&mut EventLoop, Result<(RawSock, SocketAddr), AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Accept {
                sock,
                accepted: None,
            },
            Continuation::Accept(Box::new(cb)),
        );
        self.enqueue(token);
    }

    /// Creates a socket and starts a non-blocking connect to `endpoint`.
    /// An endpoint with port zero is rejected with
    /// [`AioError::PortRequired`] before any syscall.
    pub fn connect(
        &mut self,
        endpoint: SocketAddr,
        cb: impl FnOnce(&mut EventLoop, Result<RawSock, AioError>) + 'static,
    ) {
        self.connect_deadline(endpoint, None, cb);
    }

    /// [`EventLoop::connect`] bounded by `after`; exactly one of the
    /// connect result and [`AioError::Timeout`] is delivered.
    pub fn connect_timeout(
        &mut self,
        endpoint: SocketAddr,
        after: Duration,
        cb: impl FnOnce(&mut EventLoop, Result<RawSock, AioError>) + 'static,
    ) {
        self.connect_deadline(endpoint, Some(after), cb);
    }

    fn connect_deadline(
        &mut self,
        endpoint: SocketAddr,
        after: Option<Duration>,
        cb: impl FnOnce(&mut EventLoop, Result<RawSock, AioError>) + 'static,
    ) {
        let cont = Continuation::Connect(Box::new(cb));
        if endpoint.port() == 0 {
            let token = self.pool.insert(Completion::new(
                Operation::Connect {
                    sock: net::INVALID_SOCK,
                    addr: Box::new(net::sock_addr(&endpoint)),
                    initiated: false,
                },
                cont,
            ));
            self.pool[token].forced = Some(AioError::PortRequired);
            self.completed.push_back((token, 0));
            return;
        }
        let sock = match net::tcp_socket(&endpoint) {
            Ok(sock) => sock,
            Err(err) => {
                let token = self.pool.insert(Completion::new(
                    Operation::Connect {
                        sock: net::INVALID_SOCK,
                        addr: Box::new(net::sock_addr(&endpoint)),
                        initiated: false,
                    },
                    cont,
                ));
                self.pool[token].forced = Some(err.into());
                self.completed.push_back((token, 0));
                return;
            }
        };
        let token = self.register(
            Operation::Connect {
                sock,
                addr: Box::new(net::sock_addr(&endpoint)),
                initiated: false,
            },
            cont,
        );
        self.enqueue(token);
        if let Some(after) = after {
            self.attach_timeout(token, after);
        }
    }

    /// Closes a descriptor. Not retried on interruption, so a descriptor
    /// reused elsewhere is never closed twice.
    pub fn close(
        &mut self,
        sock: RawSock,
        cb: impl FnOnce(&mut EventLoop, Result<(), AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Close { sock },
            Continuation::Unit(Box::new(cb)),
        );
        self.enqueue(token);
    }

    /// Reads into `buf` once; the buffer comes back with the result.
    /// `offset` of `None` uses the kernel file cursor.
    pub fn read(
        &mut self,
        fd: RawSock,
        buf: Vec<u8>,
        offset: Option<u64>,
        cb: impl FnOnce(&mut EventLoop, Vec<u8>, Result<usize, AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Read {
                fd,
                buf,
                offset,
                done: 0,
                all: false,
            },
            Continuation::Io(Box::new(cb)),
        );
        self.enqueue(token);
    }

    /// Reads until `buf` is full, resubmitting short reads internally.
    /// A short result never surfaces as success.
    pub fn read_all(
        &mut self,
        fd: RawSock,
        buf: Vec<u8>,
        offset: Option<u64>,
        cb: impl FnOnce(&mut EventLoop, Vec<u8>, Result<usize, AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Read {
                fd,
                buf,
                offset,
                done: 0,
                all: true,
            },
            Continuation::Io(Box::new(cb)),
        );
        self.enqueue(token);
    }

    pub fn write(
        &mut self,
        fd: RawSock,
        buf: Vec<u8>,
        offset: Option<u64>,
        cb: impl FnOnce(&mut EventLoop, Vec<u8>, Result<usize, AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Write {
                fd,
                buf,
                offset,
                done: 0,
                all: false,
            },
            Continuation::Io(Box::new(cb)),
        );
        self.enqueue(token);
    }

    pub fn write_all(
        &mut self,
        fd: RawSock,
        buf: Vec<u8>,
        offset: Option<u64>,
        cb: impl FnOnce(&mut EventLoop, Vec<u8>, Result<usize, AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Write {
                fd,
                buf,
                offset,
                done: 0,
                all: true,
            },
            Continuation::Io(Box::new(cb)),
        );
        self.enqueue(token);
    }

    pub fn recv(
        &mut self,
        sock: RawSock,
        buf: Vec<u8>,
        cb: impl FnOnce(&mut EventLoop, Vec<u8>, Result<usize, AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Recv { sock, buf },
            Continuation::Io(Box::new(cb)),
        );
        self.enqueue(token);
    }

    /// [`EventLoop::recv`] bounded by `after`.
    pub fn recv_timeout(
        &mut self,
        sock: RawSock,
        buf: Vec<u8>,
        after: Duration,
        cb: impl FnOnce(&mut EventLoop, Vec<u8>, Result<usize, AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Recv { sock, buf },
            Continuation::Io(Box::new(cb)),
        );
        self.enqueue(token);
        self.attach_timeout(token, after);
    }

    pub fn send(
        &mut self,
        sock: RawSock,
        buf: Vec<u8>,
        cb: impl FnOnce(&mut EventLoop, Vec<u8>, Result<usize, AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Send {
                sock,
                buf,
                to: None,
                done: 0,
                all: false,
            },
            Continuation::Io(Box::new(cb)),
        );
        self.enqueue(token);
    }

    /// Sends the whole buffer, resubmitting short sends internally.
    pub fn send_all(
        &mut self,
        sock: RawSock,
        buf: Vec<u8>,
        cb: impl FnOnce(&mut EventLoop, Vec<u8>, Result<usize, AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Send {
                sock,
                buf,
                to: None,
                done: 0,
                all: true,
            },
            Continuation::Io(Box::new(cb)),
        );
        self.enqueue(token);
    }

    /// Datagram send to an explicit endpoint.
    pub fn send_to(
        &mut self,
        sock: RawSock,
        buf: Vec<u8>,
        endpoint: SocketAddr,
        cb: impl FnOnce(&mut EventLoop, Vec<u8>, Result<usize, AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Send {
                sock,
                buf,
                to: Some(Box::new(net::sock_addr(&endpoint))),
                done: 0,
                all: false,
            },
            Continuation::Io(Box::new(cb)),
        );
        self.enqueue(token);
    }

    /// Fires `cb` no earlier than now + `after`. Resolution is bounded
    /// by the tick cadence.
    pub fn timeout(
        &mut self,
        after: Duration,
        cb: impl FnOnce(&mut EventLoop, Result<(), AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Timeout {
                expires: Instant::now() + after,
                target: None,
            },
            Continuation::Unit(Box::new(cb)),
        );
        self.timeouts.push(token);
    }

    /// A timeout that does not keep [`EventLoop::run`] alive; the DNS
    /// cache schedules evictions with it. Dropped unfired if the loop
    /// goes idle first.
    pub(crate) fn timeout_detached(
        &mut self,
        after: Duration,
        cb: impl FnOnce(&mut EventLoop, Result<(), AioError>) + 'static,
    ) {
        let token = self.register(
            Operation::Timeout {
                expires: Instant::now() + after,
                target: None,
            },
            Continuation::Unit(Box::new(cb)),
        );
        self.pool[token].detached = true;
        self.timeouts.push(token);
    }

    /// Fires `cb` on the next dispatch pass, before the loop blocks
    /// again.
    pub fn next_tick(
        &mut self,
        cb: impl FnOnce(&mut EventLoop, Result<(), AioError>) + 'static,
    ) {
        let token = self.register(Operation::NextTick, Continuation::Unit(Box::new(cb)));
        self.completed.push_back((token, 0));
    }

    /// Readiness notification for `fd`. One-shot polls free themselves
    /// after firing; `multi` polls persist until
    /// [`EventLoop::poll_remove`].
    pub fn poll(
        &mut self,
        fd: RawSock,
        interest: Interest,
        multi: bool,
        cb: impl FnMut(&mut EventLoop, Result<(), AioError>) + 'static,
    ) -> PollHandle {
        let token = self.register(
            Operation::Poll {
                fd,
                interest,
                multi,
            },
            Continuation::Poll(Box::new(cb)),
        );
        self.enqueue(token);
        PollHandle(token)
    }

    /// Removes a multi-shot poll. The callback does not fire again.
    pub fn poll_remove(&mut self, handle: PollHandle) {
        let target = handle.0;
        let is_poll = matches!(
            self.pool.get(target).map(|c| &c.op),
            Some(Operation::Poll { .. })
        );
        if !is_poll {
            return;
        }
        {
            let backend = &mut self.backend;
            let comp = &mut self.pool[target];
            if comp.in_kernel {
                let _ = backend.cancel(target, comp);
            }
        }
        if self.pool[target].in_kernel {
            self.io_inflight = self.io_inflight.saturating_sub(1);
        }
        self.pool.remove(target);
        self.unqueued.retain(|&t| t != target);
        let token = self.register(Operation::PollRemove { target }, Continuation::None);
        self.completed.push_back((token, 0));
    }

    /// Reads a whole file through the loop: synchronous open, then
    /// chained reads at an advancing offset.
    pub fn read_entire_file(
        &mut self,
        path: impl AsRef<Path>,
        cb: impl FnOnce(&mut EventLoop, Result<Vec<u8>, AioError>) + 'static,
    ) {
        let file = match std::fs::File::open(path.as_ref()) {
            Ok(file) => file,
            Err(err) => {
                let err: AioError = err.into();
                self.next_tick(move |lp, _| cb(lp, Err(err)));
                return;
            }
        };
        read_file_chunk(self, file, Vec::new(), 0, Box::new(cb));
    }

    // ---- internals ---------------------------------------------------

    fn register(&mut self, op: Operation, cont: Continuation) -> Token {
        self.pool.insert(Completion::new(op, cont))
    }

    /// Pushes a registered completion toward the kernel. Synchronous
    /// completions go straight to the completed queue; a full kernel
    /// queue drains once and retries, then falls back to the unqueued
    /// list.
    fn enqueue(&mut self, token: Token) {
        if self.pool[token].forced.is_some() {
            self.completed.push_back((token, 0));
            return;
        }
        let outcome = {
            let backend = &mut self.backend;
            let comp = &mut self.pool[token];
            backend.submit(token, comp)
        };
        match outcome {
            Ok(SubmitResult::Queued) => {
                self.pool[token].in_kernel = true;
                self.io_inflight += 1;
            }
            Ok(SubmitResult::Done(result)) => self.completed.push_back((token, result)),
            Ok(SubmitResult::Full) => {
                log::debug!("kernel submission queue full, draining once");
                let _ = self.drain_kernel(Some(Duration::ZERO));
                let retried = {
                    let backend = &mut self.backend;
                    let comp = &mut self.pool[token];
                    backend.submit(token, comp)
                };
                match retried {
                    Ok(SubmitResult::Queued) => {
                        self.pool[token].in_kernel = true;
                        self.io_inflight += 1;
                    }
                    Ok(SubmitResult::Done(result)) => self.completed.push_back((token, result)),
                    Ok(SubmitResult::Full) => self.unqueued.push_back(token),
                    Err(err) => {
                        self.pool[token].forced = Some(err.into());
                        self.completed.push_back((token, 0));
                    }
                }
            }
            Err(err) => {
                self.pool[token].forced = Some(err.into());
                self.completed.push_back((token, 0));
            }
        }
    }

    fn attach_timeout(&mut self, target: Token, after: Duration) {
        if !self.pool.contains(target) {
            return;
        }
        let companion = self.pool.insert(Completion::new(
            Operation::Timeout {
                expires: Instant::now() + after,
                target: Some(target),
            },
            Continuation::None,
        ));
        self.pool[target].timeout = Some(companion);
        self.timeouts.push(companion);
    }

    /// Scans the timeout list: drops cancelled companions, moves expired
    /// entries along, and reports the smallest remaining delay as the
    /// kernel wait ceiling.
    fn flush_timeouts(&mut self) -> Option<Duration> {
        let now = Instant::now();
        let mut ceiling: Option<Duration> = None;
        let mut index = 0;
        while index < self.timeouts.len() {
            let token = self.timeouts[index];
            let state = match self.pool.get(token) {
                Some(comp) => match comp.op {
                    Operation::Timeout { expires, target } => {
                        Some((comp.cancelled, expires, target))
                    }
                    _ => None,
                },
                None => None,
            };
            let (cancelled, expires, target) = match state {
                Some(state) => state,
                None => {
                    self.timeouts.swap_remove(index);
                    continue;
                }
            };
            if cancelled {
                self.pool.remove(token);
                self.timeouts.swap_remove(index);
                continue;
            }
            if expires > now {
                let remaining = expires - now;
                ceiling = Some(match ceiling {
                    Some(c) => c.min(remaining),
                    None => remaining,
                });
                index += 1;
                continue;
            }
            self.timeouts.swap_remove(index);
            match target {
                None => self.completed.push_back((token, 0)),
                Some(target) => {
                    self.expire_target(target);
                    self.pool.remove(token);
                }
            }
        }
        ceiling
    }

    /// A companion timeout fired: fail its guarded op with `Timeout`.
    /// An op already in the kernel gets a cancel; one still unqueued is
    /// failed on its next dispatch. An op whose result already arrived
    /// wins the race and nothing happens here.
    fn expire_target(&mut self, target: Token) {
        let in_kernel = match self.pool.get(target) {
            Some(comp) => comp.in_kernel,
            None => return,
        };
        if in_kernel {
            {
                let comp = &mut self.pool[target];
                comp.forced = Some(AioError::Timeout);
                comp.timeout = None;
            }
            let backend = &mut self.backend;
            let comp = &mut self.pool[target];
            if let Err(err) = backend.cancel(target, comp) {
                log::warn!("cancelling timed-out op failed: {}", err);
            }
        } else if self.unqueued.contains(&target) {
            let comp = &mut self.pool[target];
            comp.forced = Some(AioError::Timeout);
            comp.timeout = None;
        }
    }

    fn flush_submissions(&mut self) {
        let count = self.unqueued.len();
        for _ in 0..count {
            let token = match self.unqueued.pop_front() {
                Some(token) => token,
                None => break,
            };
            if !self.pool.contains(token) {
                continue;
            }
            self.enqueue(token);
        }
    }

    fn drain_kernel(&mut self, wait: Option<Duration>) -> io::Result<()> {
        let before = self.completed.len();
        {
            let backend = &mut self.backend;
            backend.poll(wait, &mut self.pool, &mut self.completed)?;
        }
        let mut companions = Vec::new();
        for i in before..self.completed.len() {
            let (token, _) = self.completed[i];
            if let Some(comp) = self.pool.get_mut(token) {
                let multi = matches!(comp.op, Operation::Poll { multi: true, .. });
                if !multi {
                    comp.in_kernel = false;
                    self.io_inflight = self.io_inflight.saturating_sub(1);
                }
                if let Some(companion) = comp.timeout {
                    companions.push(companion);
                }
            }
        }
        for companion in companions {
            if let Some(comp) = self.pool.get_mut(companion) {
                comp.cancelled = true;
            }
        }
        Ok(())
    }

    /// Dispatches up to a snapshot of the completed queue's length, so a
    /// callback that resubmits cannot re-enter this pass.
    fn dispatch(&mut self) {
        let count = self.completed.len();
        for _ in 0..count {
            let (token, raw) = match self.completed.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            self.dispatch_one(token, raw);
        }
    }

    fn dispatch_one(&mut self, token: Token, raw: i32) {
        if !self.pool.contains(token) {
            return;
        }
        let forced = self.pool[token].forced;

        // transparent retry: WouldBlock / Interrupted never surface.
        // close is the exception, so an interrupted close can never hit
        // a descriptor the OS already reused
        let retriable = !matches!(self.pool[token].op, Operation::Close { .. });
        if retriable && raw < 0 && transparent_retry(-raw) && forced.is_none() {
            self.enqueue(token);
            return;
        }

        // partial progress on an `_all` op: advance and resubmit
        if raw > 0 && forced.is_none() {
            let again = {
                let comp = &mut self.pool[token];
                match &mut comp.op {
                    Operation::Read {
                        buf,
                        done,
                        all: true,
                        ..
                    }
                    | Operation::Write {
                        buf,
                        done,
                        all: true,
                        ..
                    }
                    | Operation::Send {
                        buf,
                        done,
                        all: true,
                        ..
                    } => {
                        *done += raw as usize;
                        *done < buf.len()
                    }
                    _ => false,
                }
            };
            if again {
                self.enqueue(token);
                return;
            }
        }

        // the op finished: the companion timeout loses the race
        if let Some(companion) = self.pool[token].timeout.take() {
            if let Some(comp) = self.pool.get_mut(companion) {
                comp.cancelled = true;
            }
        }

        let error = match forced {
            Some(err) => Some(err),
            None if raw < 0 => Some(AioError::from_errno(-raw)),
            None => None,
        };

        // multi-shot polls fire without being freed
        if matches!(self.pool[token].op, Operation::Poll { multi: true, .. }) {
            let mut cont = std::mem::replace(&mut self.pool[token].cont, Continuation::None);
            if let Continuation::Poll(cb) = &mut cont {
                let result = match error {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                cb(self, result);
            }
            if let Some(comp) = self.pool.get_mut(token) {
                if matches!(comp.cont, Continuation::None) {
                    comp.cont = cont;
                }
            }
            return;
        }

        let comp = self.pool.remove(token);
        match (comp.op, comp.cont) {
            (Operation::Accept { accepted, .. }, Continuation::Accept(cb)) => {
                let result = match error {
                    Some(err) => Err(err),
                    None => {
                        let sock = accepted.unwrap_or(raw as RawSock);
                        match net::peer_addr(sock) {
                            Ok(addr) => Ok((sock, addr)),
                            Err(err) => Err(err.into()),
                        }
                    }
                };
                cb(self, result);
            }
            (Operation::Connect { sock, .. }, Continuation::Connect(cb)) => {
                let result = match error {
                    Some(err) => Err(err),
                    None => Ok(sock),
                };
                cb(self, result);
            }
            (Operation::Recv { buf, .. }, Continuation::Io(cb)) => {
                let result = match error {
                    Some(err) => Err(err),
                    None => Ok(raw.max(0) as usize),
                };
                cb(self, buf, result);
            }
            (
                Operation::Read { buf, done, all, .. },
                Continuation::Io(cb),
            )
            | (
                Operation::Write { buf, done, all, .. },
                Continuation::Io(cb),
            )
            | (
                Operation::Send {
                    buf, done, all, ..
                },
                Continuation::Io(cb),
            ) => {
                let total = done + raw.max(0) as usize;
                let result = match error {
                    Some(err) => Err(err),
                    // EOF or zero-write before an `_all` op finished
                    None if all && total < buf.len() => Err(AioError::ConnectionClosed),
                    None => Ok(total),
                };
                cb(self, buf, result);
            }
            (Operation::Close { .. }, Continuation::Unit(cb))
            | (Operation::Timeout { .. }, Continuation::Unit(cb))
            | (Operation::NextTick, Continuation::Unit(cb)) => {
                let result = match error {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                cb(self, result);
            }
            (Operation::Poll { .. }, Continuation::Poll(mut cb)) => {
                let result = match error {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
                cb(self, result);
            }
            (_, Continuation::None) => {}
            (op, _) => log::error!("completion for {} lost its continuation", op.name()),
        }
    }
}

fn read_file_chunk(
    lp: &mut EventLoop,
    file: std::fs::File,
    mut acc: Vec<u8>,
    offset: u64,
    cb: Box<dyn FnOnce(&mut EventLoop, Result<Vec<u8>, AioError>)>,
) {
    let fd = file_descriptor(&file);
    let chunk = vec![0u8; 4096];
    lp.read(fd, chunk, Some(offset), move |lp, buf, result| {
        match result {
            Ok(0) => {
                drop(file);
                cb(lp, Ok(acc));
            }
            Ok(n) => {
                acc.extend_from_slice(&buf[..n]);
                read_file_chunk(lp, file, acc, offset + n as u64, cb);
            }
            Err(err) => {
                drop(file);
                cb(lp, Err(err));
            }
        }
    });
}

#[cfg(unix)]
fn file_descriptor(file: &std::fs::File) -> RawSock {
    use std::os::fd::AsRawFd;
    file.as_raw_fd()
}

#[cfg(windows)]
fn file_descriptor(file: &std::fs::File) -> RawSock {
    use std::os::windows::io::AsRawHandle;
    file.as_raw_handle() as usize as RawSock
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[cfg(unix)]
    fn bound_udp() -> (RawSock, SocketAddr) {
        use std::os::fd::IntoRawFd;
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_nonblocking(true).unwrap();
        let addr = socket.local_addr().unwrap();
        (socket.into_raw_fd(), addr)
    }

    #[test]
    fn next_tick_fires_in_submission_order() {
        let mut lp = EventLoop::new().unwrap();
        let order = Rc::new(RefCell::new(Vec::new()));

        let first = order.clone();
        lp.next_tick(move |_, _| first.borrow_mut().push(1));
        let second = order.clone();
        lp.next_tick(move |_, _| second.borrow_mut().push(2));

        lp.run().unwrap();
        assert_eq!(*order.borrow(), vec![1, 2]);
    }

    #[test]
    fn timeout_fires_no_earlier_than_duration() {
        let mut lp = EventLoop::new().unwrap();
        let fired = Rc::new(RefCell::new(false));

        let flag = fired.clone();
        let start = Instant::now();
        lp.timeout(Duration::from_millis(30), move |_, result| {
            assert!(result.is_ok());
            *flag.borrow_mut() = true;
        });

        lp.run().unwrap();
        assert!(*fired.borrow());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[cfg(unix)]
    #[test]
    fn udp_send_to_and_recv() {
        let mut lp = EventLoop::new().unwrap();
        let (sender, _) = bound_udp();
        let (receiver, receiver_addr) = bound_udp();

        let got = Rc::new(RefCell::new(None));
        let slot = got.clone();
        lp.recv(receiver, vec![0u8; 64], move |_, buf, result| {
            let n = result.unwrap();
            *slot.borrow_mut() = Some(buf[..n].to_vec());
        });
        lp.send_to(sender, b"ping".to_vec(), receiver_addr, |_, _, result| {
            assert_eq!(result.unwrap(), 4);
        });

        lp.run().unwrap();
        assert_eq!(got.borrow().as_deref(), Some(&b"ping"[..]));

        lp.close(sender, |_, _| {});
        lp.close(receiver, |_, _| {});
        lp.run().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn recv_timeout_delivers_timeout_error() {
        let mut lp = EventLoop::new().unwrap();
        let (sock, _) = bound_udp();

        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        lp.recv_timeout(
            sock,
            vec![0u8; 16],
            Duration::from_millis(40),
            move |_, _, result| {
                *slot.borrow_mut() = Some(result);
            },
        );

        lp.run().unwrap();
        assert_eq!(*seen.borrow(), Some(Err(AioError::Timeout)));
    }

    #[test]
    fn connect_to_port_zero_is_rejected_without_a_syscall() {
        let mut lp = EventLoop::new().unwrap();
        let seen = Rc::new(RefCell::new(None));

        let slot = seen.clone();
        lp.connect("127.0.0.1:0".parse().unwrap(), move |_, result| {
            *slot.borrow_mut() = Some(result.map(|_| ()));
        });

        lp.run().unwrap();
        assert_eq!(*seen.borrow(), Some(Err(AioError::PortRequired)));
    }

    #[test]
    fn connect_to_closed_port_is_refused() {
        // bind, learn the port, close: nothing listens there afterwards
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut lp = EventLoop::new().unwrap();
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        lp.connect_timeout(addr, Duration::from_millis(500), move |lp, result| {
            if let Ok(sock) = result {
                lp.close(sock, |_, _| {});
            }
            *slot.borrow_mut() = Some(result.map(|_| ()));
        });

        lp.run().unwrap();
        let outcome = seen.borrow().clone().expect("callback fired");
        assert!(
            matches!(outcome, Err(AioError::ConnectRefused) | Err(AioError::Timeout)),
            "unexpected outcome: {:?}",
            outcome
        );
    }

    #[test]
    fn accept_hands_back_the_peer() {
        let mut lp = EventLoop::new().unwrap();
        let listener = net::tcp_listener(&"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = net::local_addr(listener).unwrap();

        let accepted = Rc::new(RefCell::new(None));
        let slot = accepted.clone();
        lp.accept(listener, move |lp, result| {
            let (sock, peer) = result.unwrap();
            *slot.borrow_mut() = Some(peer);
            lp.close(sock, |_, _| {});
        });
        lp.connect(addr, |lp, result| {
            let sock = result.unwrap();
            lp.close(sock, |_, _| {});
        });

        lp.run().unwrap();
        let peer = accepted.borrow().expect("a connection was accepted");
        assert_eq!(peer.ip(), addr.ip());
        lp.close(listener, |_, _| {});
        lp.run().unwrap();
    }

    #[test]
    fn read_entire_file_returns_every_byte() {
        let path = std::env::temp_dir().join(format!("riptide-read-{}", std::process::id()));
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let mut lp = EventLoop::new().unwrap();
        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        lp.read_entire_file(&path, move |_, result| {
            *slot.borrow_mut() = Some(result.unwrap());
        });

        lp.run().unwrap();
        assert_eq!(seen.borrow().as_deref(), Some(&content[..]));
        std::fs::remove_file(&path).unwrap();
    }
}
