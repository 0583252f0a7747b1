//! kqueue backend
//!
//! kqueue reports readiness, not completions, so operations are
//! attempted eagerly with the non-blocking syscall and parked behind a
//! one-shot filter when the socket pushes back. A firing filter re-runs
//! the attempt; the raw result then flows out like any completion.

use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use slab::Slab;

use crate::aio::completion::{Completion, Interest, Operation, Token};
use crate::aio::sys::{self, Attempt, Backend, SubmitResult};

#[cfg(not(target_os = "netbsd"))]
type UData = *mut libc::c_void;
#[cfg(target_os = "netbsd")]
type UData = libc::intptr_t;

#[cfg(not(target_os = "netbsd"))]
type Flags = u16;
#[cfg(target_os = "netbsd")]
type Flags = u32;

macro_rules! kevent {
    ($id:expr, $filter:expr, $flags:expr, $udata:expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as _,
            flags: $flags as _,
            fflags: 0,
            data: 0,
            udata: $udata as UData,
        }
    };
}

const EVENT_CAPACITY: usize = 256;

pub(crate) struct Kqueue {
    kq: RawFd,
    /// Completions produced outside the kernel (cancellations).
    synthesized: VecDeque<(Token, i32)>,
}

impl Kqueue {
    pub(crate) fn new() -> io::Result<Kqueue> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }
        unsafe {
            libc::fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC);
        }
        Ok(Kqueue {
            kq,
            synthesized: VecDeque::new(),
        })
    }

    fn filter(interest: Interest) -> i16 {
        match interest {
            Interest::Read => libc::EVFILT_READ as i16,
            Interest::Write => libc::EVFILT_WRITE as i16,
        }
    }

    fn change(&mut self, fd: RawFd, interest: Interest, flags: Flags, token: Token) -> io::Result<()> {
        let mut changes = [kevent!(fd, Self::filter(interest), flags, token)];
        let r = unsafe {
            libc::kevent(
                self.kq,
                changes.as_mut_ptr(),
                1,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if r < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn park(&mut self, fd: RawFd, interest: Interest, oneshot: bool, token: Token) -> io::Result<()> {
        let mut flags = libc::EV_ADD;
        if oneshot {
            flags |= libc::EV_ONESHOT;
        }
        self.change(fd, interest, flags, token)
    }

    fn unpark(&mut self, fd: RawFd, interest: Interest) {
        // the filter may already be gone (one-shot fired); best effort
        let _ = self.change(fd, interest, libc::EV_DELETE, 0);
    }
}

impl Drop for Kqueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.kq);
        }
    }
}

impl Backend for Kqueue {
    fn submit(&mut self, token: Token, comp: &mut Completion) -> io::Result<SubmitResult> {
        match &mut comp.op {
            Operation::Poll {
                fd,
                interest,
                multi,
            } => {
                let (fd, interest, oneshot) = (*fd, *interest, !*multi);
                self.park(fd, interest, oneshot, token)?;
                Ok(SubmitResult::Queued)
            }
            Operation::Timeout { .. } | Operation::NextTick | Operation::PollRemove { .. } => {
                unreachable!("operation is handled outside the kernel")
            }
            op => match sys::perform(op) {
                Attempt::Done(r) => Ok(SubmitResult::Done(r)),
                Attempt::WouldBlock => {
                    let interest = sys::park_interest(op);
                    let fd = match op {
                        Operation::Accept { sock, .. }
                        | Operation::Connect { sock, .. }
                        | Operation::Recv { sock, .. }
                        | Operation::Send { sock, .. }
                        | Operation::Close { sock } => *sock,
                        Operation::Read { fd, .. } | Operation::Write { fd, .. } => *fd,
                        _ => unreachable!(),
                    };
                    self.park(fd, interest, true, token)?;
                    Ok(SubmitResult::Queued)
                }
            },
        }
    }

    fn poll(
        &mut self,
        wait: Option<Duration>,
        pool: &mut Slab<Completion>,
        completed: &mut VecDeque<(Token, i32)>,
    ) -> io::Result<()> {
        let mut wait = wait;
        if !self.synthesized.is_empty() {
            completed.extend(self.synthesized.drain(..));
            wait = Some(Duration::ZERO);
        }

        let timespec = wait.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(d.subsec_nanos() as i32),
        });
        let timespec_ptr = timespec
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        let mut events: Vec<libc::kevent> = Vec::with_capacity(EVENT_CAPACITY);
        let count = unsafe {
            libc::kevent(
                self.kq,
                ptr::null_mut(),
                0,
                events.as_mut_ptr(),
                EVENT_CAPACITY as _,
                timespec_ptr,
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(err);
        }
        unsafe { events.set_len(count as usize) };

        for event in &events {
            let token = event.udata as Token;
            if (event.flags & libc::EV_ERROR) != 0 && event.data != 0 {
                completed.push_back((token, -(event.data as i32)));
                continue;
            }
            let comp = match pool.get_mut(token) {
                Some(comp) => comp,
                None => {
                    log::debug!("discarding readiness for freed token {}", token);
                    continue;
                }
            };
            match &mut comp.op {
                Operation::Poll { .. } => completed.push_back((token, 0)),
                op => match sys::perform(op) {
                    Attempt::Done(r) => completed.push_back((token, r)),
                    Attempt::WouldBlock => {
                        let interest = sys::park_interest(op);
                        let fd = event.ident as RawFd;
                        self.park(fd, interest, true, token)?;
                    }
                },
            }
        }
        Ok(())
    }

    fn cancel(&mut self, token: Token, comp: &mut Completion) -> io::Result<()> {
        let target = match &comp.op {
            Operation::Poll { fd, interest, .. } => Some((*fd, *interest)),
            Operation::Accept { sock, .. } | Operation::Recv { sock, .. } => {
                Some((*sock, Interest::Read))
            }
            Operation::Connect { sock, .. } | Operation::Send { sock, .. } => {
                Some((*sock, Interest::Write))
            }
            Operation::Read { fd, .. } => Some((*fd, Interest::Read)),
            Operation::Write { fd, .. } => Some((*fd, Interest::Write)),
            _ => None,
        };
        if let Some((fd, interest)) = target {
            self.unpark(fd, interest);
        }
        self.synthesized.push_back((token, -libc::ECANCELED));
        Ok(())
    }
}
