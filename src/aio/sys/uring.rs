//! io_uring backend
//!
//! Stream and file operations map directly onto ring opcodes. Datagram
//! sends with an explicit endpoint are attempted eagerly with `sendto`
//! and parked on a write-poll when the socket pushes back, so endpoint
//! handling stays identical across backends.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use io_uring::{cqueue, opcode, squeue, types, IoUring};
use slab::Slab;

use crate::aio::completion::{Completion, Interest, Operation, Token, RESERVED_TOKEN};
use crate::aio::sys::{self, Attempt, Backend, SubmitResult};

const RING_ENTRIES: u32 = 256;

pub(crate) struct Uring {
    ring: IoUring,
    /// Entries that must reach the kernel but found the ring full
    /// (cancellations, poll re-arms). Flushed before every wait.
    backlog: VecDeque<squeue::Entry>,
}

impl Uring {
    pub(crate) fn new() -> io::Result<Uring> {
        Ok(Uring {
            ring: IoUring::new(RING_ENTRIES)?,
            backlog: VecDeque::new(),
        })
    }

    fn try_push(&mut self, entry: squeue::Entry) -> bool {
        unsafe { self.ring.submission().push(&entry).is_ok() }
    }

    fn push_or_backlog(&mut self, entry: squeue::Entry) {
        if !self.try_push(entry.clone()) {
            self.backlog.push_back(entry);
        }
    }

    fn flush_backlog(&mut self) {
        while let Some(entry) = self.backlog.front() {
            if !self.try_push(entry.clone()) {
                break;
            }
            self.backlog.pop_front();
        }
    }

    fn poll_mask(interest: Interest) -> u32 {
        match interest {
            Interest::Read => libc::POLLIN as u32,
            Interest::Write => libc::POLLOUT as u32,
        }
    }

    /// Builds the ring entry for an operation, or `None` when the op is
    /// handled eagerly instead.
    fn entry_for(token: Token, op: &mut Operation) -> Option<squeue::Entry> {
        let user_data = token as u64;
        let entry = match op {
            Operation::Accept { sock, .. } => opcode::Accept::new(
                types::Fd(*sock),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
            .flags(libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK)
            .build(),
            Operation::Close { sock } => opcode::Close::new(types::Fd(*sock)).build(),
            Operation::Connect { sock, addr, .. } => {
                opcode::Connect::new(types::Fd(*sock), addr.as_ptr() as *const _, addr.len())
                    .build()
            }
            Operation::Read {
                fd,
                buf,
                offset,
                done,
                ..
            } => {
                let off = match offset {
                    Some(o) => *o + *done as u64,
                    None => u64::MAX, // current file position
                };
                opcode::Read::new(
                    types::Fd(*fd),
                    buf[*done..].as_mut_ptr(),
                    (buf.len() - *done) as u32,
                )
                .offset(off)
                .build()
            }
            Operation::Write {
                fd,
                buf,
                offset,
                done,
                ..
            } => {
                let off = match offset {
                    Some(o) => *o + *done as u64,
                    None => u64::MAX,
                };
                opcode::Write::new(
                    types::Fd(*fd),
                    buf[*done..].as_ptr(),
                    (buf.len() - *done) as u32,
                )
                .offset(off)
                .build()
            }
            Operation::Recv { sock, buf } => {
                opcode::Recv::new(types::Fd(*sock), buf.as_mut_ptr(), buf.len() as u32).build()
            }
            Operation::Send {
                sock,
                buf,
                to: None,
                done,
                ..
            } => opcode::Send::new(
                types::Fd(*sock),
                buf[*done..].as_ptr(),
                (buf.len() - *done) as u32,
            )
            .build(),
            Operation::Send { to: Some(_), .. } => return None,
            Operation::Poll {
                fd,
                interest,
                multi,
            } => opcode::PollAdd::new(types::Fd(*fd), Self::poll_mask(*interest))
                .multi(*multi)
                .build(),
            Operation::Timeout { .. } | Operation::NextTick | Operation::PollRemove { .. } => {
                unreachable!("operation is handled outside the kernel")
            }
        };
        Some(entry.user_data(user_data))
    }
}

impl Backend for Uring {
    fn submit(&mut self, token: Token, comp: &mut Completion) -> io::Result<SubmitResult> {
        match Self::entry_for(token, &mut comp.op) {
            Some(entry) => {
                if self.try_push(entry) {
                    Ok(SubmitResult::Queued)
                } else {
                    Ok(SubmitResult::Full)
                }
            }
            None => {
                // datagram send with endpoint: eager, park on writability
                match sys::perform(&mut comp.op) {
                    Attempt::Done(r) => Ok(SubmitResult::Done(r)),
                    Attempt::WouldBlock => {
                        let mask = Self::poll_mask(sys::park_interest(&comp.op));
                        let sock = match comp.op {
                            Operation::Send { sock, .. } => sock,
                            _ => unreachable!(),
                        };
                        let entry = opcode::PollAdd::new(types::Fd(sock), mask)
                            .build()
                            .user_data(token as u64);
                        if self.try_push(entry) {
                            Ok(SubmitResult::Queued)
                        } else {
                            Ok(SubmitResult::Full)
                        }
                    }
                }
            }
        }
    }

    fn poll(
        &mut self,
        wait: Option<Duration>,
        pool: &mut Slab<Completion>,
        completed: &mut VecDeque<(Token, i32)>,
    ) -> io::Result<()> {
        self.flush_backlog();

        let waited = match wait {
            Some(d) if d.is_zero() => self.ring.submit().map(|_| ()),
            Some(d) => {
                let ts = types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args).map(|_| ())
            }
            None => self.ring.submit_and_wait(1).map(|_| ()),
        };
        if let Err(err) = waited {
            match err.raw_os_error() {
                // timed out, interrupted or completion-queue pressure:
                // whatever is in the queue still gets drained below
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
                _ => return Err(err),
            }
        }

        let entries: Vec<(u64, i32, u32)> = self
            .ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result(), cqe.flags()))
            .collect();

        for (user_data, result, flags) in entries {
            let token = user_data as Token;
            if token == RESERVED_TOKEN {
                continue;
            }
            let comp = match pool.get_mut(token) {
                Some(comp) => comp,
                None => {
                    log::debug!("discarding completion for freed token {}", token);
                    continue;
                }
            };
            match &mut comp.op {
                Operation::Send { to: Some(_), .. } => {
                    if result < 0 {
                        completed.push_back((token, result));
                        continue;
                    }
                    match sys::perform(&mut comp.op) {
                        Attempt::Done(r) => completed.push_back((token, r)),
                        Attempt::WouldBlock => {
                            let mask = Self::poll_mask(sys::park_interest(&comp.op));
                            let sock = match comp.op {
                                Operation::Send { sock, .. } => sock,
                                _ => unreachable!(),
                            };
                            let entry = opcode::PollAdd::new(types::Fd(sock), mask)
                                .build()
                                .user_data(user_data);
                            self.push_or_backlog(entry);
                        }
                    }
                }
                Operation::Poll {
                    fd,
                    interest,
                    multi,
                } => {
                    if *multi && result >= 0 && !cqueue::more(flags) {
                        // the kernel ended the multishot; re-arm it
                        let entry =
                            opcode::PollAdd::new(types::Fd(*fd), Self::poll_mask(*interest))
                                .multi(true)
                                .build()
                                .user_data(user_data);
                        self.push_or_backlog(entry);
                    }
                    completed.push_back((token, if result < 0 { result } else { 0 }));
                }
                _ => completed.push_back((token, result)),
            }
        }
        Ok(())
    }

    fn cancel(&mut self, token: Token, _comp: &mut Completion) -> io::Result<()> {
        let entry = opcode::AsyncCancel::new(token as u64)
            .build()
            .user_data(RESERVED_TOKEN as u64);
        self.push_or_backlog(entry);
        Ok(())
    }
}
