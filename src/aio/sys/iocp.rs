//! IOCP backend
//!
//! Every parked operation owns a boxed `OVERLAPPED` extended with its
//! pool token; the port hands the pointer back on dequeue. Sockets are
//! associated with the port on first use. Readiness polls are emulated:
//! a zero-byte receive signals read readiness, write readiness is
//! reported immediately (a connected socket is almost always writable).

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::mem;
use std::ptr;
use std::time::Duration;

use slab::Slab;

use windows_sys::Win32::Foundation::{
    CloseHandle, GetLastError, ERROR_IO_PENDING, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Networking::WinSock::{
    bind, closesocket, getsockname, setsockopt, WSAGetLastError, WSAIoctl, WSARecv, WSASend,
    WSASendTo, WSASocketW, AF_INET, AF_INET6, INVALID_SOCKET, IPPROTO_TCP, SOCKADDR,
    SOCKADDR_STORAGE, SOCKET, SOCKET_ERROR, SOCK_STREAM, SOL_SOCKET,
    SIO_GET_EXTENSION_FUNCTION_POINTER, SO_UPDATE_ACCEPT_CONTEXT, SO_UPDATE_CONNECT_CONTEXT,
    WSABUF, WSAID_ACCEPTEX, WSAID_CONNECTEX, WSA_FLAG_OVERLAPPED, WSA_IO_PENDING,
};
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::IO::{
    CancelIoEx, CreateIoCompletionPort, GetQueuedCompletionStatusEx, OVERLAPPED, OVERLAPPED_ENTRY,
};

use crate::aio::completion::{Completion, Interest, Operation, Token};
use crate::aio::sys::{Backend, SubmitResult};
use crate::net::RawSock;

const ENTRY_CAPACITY: usize = 256;
const ADDR_SLOT: u32 = mem::size_of::<SOCKADDR_STORAGE>() as u32 + 16;

type AcceptExFn = unsafe extern "system" fn(
    SOCKET,
    SOCKET,
    *mut core::ffi::c_void,
    u32,
    u32,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

type ConnectExFn = unsafe extern "system" fn(
    SOCKET,
    *const SOCKADDR,
    i32,
    *const core::ffi::c_void,
    u32,
    *mut u32,
    *mut OVERLAPPED,
) -> i32;

/// An `OVERLAPPED` extended with the pool token; the port returns the
/// pointer and the prefix layout recovers the token.
#[repr(C)]
struct OverlappedOp {
    overlapped: OVERLAPPED,
    token: Token,
    /// AcceptEx address scratch + the pre-created accept socket.
    accept: Option<(SOCKET, Vec<u8>)>,
}

impl OverlappedOp {
    fn new(token: Token) -> Box<OverlappedOp> {
        Box::new(OverlappedOp {
            overlapped: unsafe { mem::zeroed() },
            token,
            accept: None,
        })
    }
}

pub(crate) struct Iocp {
    port: HANDLE,
    associated: HashSet<RawSock>,
    inflight: HashMap<Token, Box<OverlappedOp>>,
    synthesized: VecDeque<(Token, i32)>,
    accept_ex: Option<AcceptExFn>,
    connect_ex: Option<ConnectExFn>,
}

fn wsa_err() -> i32 {
    unsafe { WSAGetLastError() }
}

impl Iocp {
    pub(crate) fn new() -> io::Result<Iocp> {
        let port = unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0, 0, 1) };
        if port == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Iocp {
            port,
            associated: HashSet::new(),
            inflight: HashMap::new(),
            synthesized: VecDeque::new(),
            accept_ex: None,
            connect_ex: None,
        })
    }

    fn associate(&mut self, sock: RawSock) -> io::Result<()> {
        if self.associated.contains(&sock) {
            return Ok(());
        }
        let r = unsafe { CreateIoCompletionPort(sock as HANDLE, self.port, 0, 0) };
        if r == 0 {
            return Err(io::Error::last_os_error());
        }
        self.associated.insert(sock);
        Ok(())
    }

    fn extension<F: Copy>(&self, sock: SOCKET, guid: windows_sys::core::GUID) -> io::Result<F> {
        let mut func = mem::MaybeUninit::<F>::uninit();
        let mut bytes = 0u32;
        let r = unsafe {
            WSAIoctl(
                sock,
                SIO_GET_EXTENSION_FUNCTION_POINTER,
                &guid as *const _ as *const core::ffi::c_void,
                mem::size_of_val(&guid) as u32,
                func.as_mut_ptr() as *mut core::ffi::c_void,
                mem::size_of::<F>() as u32,
                &mut bytes,
                ptr::null_mut(),
                None,
            )
        };
        if r == SOCKET_ERROR {
            return Err(io::Error::from_raw_os_error(wsa_err()));
        }
        Ok(unsafe { func.assume_init() })
    }

    fn family_of(sock: SOCKET) -> io::Result<u16> {
        let mut storage: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<SOCKADDR_STORAGE>() as i32;
        let r = unsafe { getsockname(sock, &mut storage as *mut _ as *mut SOCKADDR, &mut len) };
        if r == SOCKET_ERROR {
            return Err(io::Error::from_raw_os_error(wsa_err()));
        }
        Ok(storage.ss_family)
    }

    /// Interprets the return of an overlapped call: queued to the port
    /// (also when it finished synchronously; the port still reports it)
    /// or failed outright.
    fn pended(&mut self, token: Token, ov: Box<OverlappedOp>, r: i32) -> SubmitResult {
        if r == 0 || r == SOCKET_ERROR {
            let err = wsa_err();
            if r == SOCKET_ERROR && err != WSA_IO_PENDING as i32 {
                return SubmitResult::Done(-err);
            }
        }
        self.inflight.insert(token, ov);
        SubmitResult::Queued
    }
}

impl Drop for Iocp {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.port);
        }
    }
}

impl Backend for Iocp {
    fn submit(&mut self, token: Token, comp: &mut Completion) -> io::Result<SubmitResult> {
        match &mut comp.op {
            Operation::Close { sock } => {
                let r = unsafe { closesocket(*sock as SOCKET) };
                self.associated.remove(sock);
                Ok(SubmitResult::Done(if r == 0 { 0 } else { -wsa_err() }))
            }
            Operation::Accept { sock, accepted } => {
                self.associate(*sock)?;
                let listener = *sock as SOCKET;
                if self.accept_ex.is_none() {
                    self.accept_ex = Some(self.extension::<AcceptExFn>(listener, WSAID_ACCEPTEX)?);
                }
                let accept_ex = self.accept_ex.unwrap();
                let family = Self::family_of(listener)?;
                let client = unsafe {
                    WSASocketW(
                        family as i32,
                        SOCK_STREAM,
                        IPPROTO_TCP,
                        ptr::null(),
                        0,
                        WSA_FLAG_OVERLAPPED,
                    )
                };
                if client == INVALID_SOCKET {
                    return Ok(SubmitResult::Done(-wsa_err()));
                }
                *accepted = Some(client as RawSock);
                let mut ov = OverlappedOp::new(token);
                ov.accept = Some((client, vec![0u8; 2 * ADDR_SLOT as usize]));
                let (buf_ptr, overlapped) = {
                    let (_, buf) = ov.accept.as_mut().unwrap();
                    (
                        buf.as_mut_ptr() as *mut core::ffi::c_void,
                        &mut ov.overlapped as *mut OVERLAPPED,
                    )
                };
                let mut received = 0u32;
                let r = unsafe {
                    accept_ex(
                        listener,
                        client,
                        buf_ptr,
                        0,
                        ADDR_SLOT,
                        ADDR_SLOT,
                        &mut received,
                        overlapped,
                    )
                };
                Ok(self.pended(token, ov, r))
            }
            Operation::Connect { sock, addr, .. } => {
                self.associate(*sock)?;
                let socket = *sock as SOCKET;
                if self.connect_ex.is_none() {
                    self.connect_ex = Some(self.extension::<ConnectExFn>(socket, WSAID_CONNECTEX)?);
                }
                let connect_ex = self.connect_ex.unwrap();
                // ConnectEx requires a bound socket
                let mut local: SOCKADDR_STORAGE = unsafe { mem::zeroed() };
                local.ss_family = if addr.is_ipv4() { AF_INET } else { AF_INET6 };
                let local_len = if addr.is_ipv4() { 16 } else { 28 };
                unsafe {
                    bind(socket, &local as *const _ as *const SOCKADDR, local_len);
                }
                let mut ov = OverlappedOp::new(token);
                let overlapped = &mut ov.overlapped as *mut OVERLAPPED;
                let r = unsafe {
                    connect_ex(
                        socket,
                        addr.as_ptr() as *const SOCKADDR,
                        addr.len() as i32,
                        ptr::null(),
                        0,
                        ptr::null_mut(),
                        overlapped,
                    )
                };
                Ok(self.pended(token, ov, r))
            }
            Operation::Read {
                fd,
                buf,
                offset,
                done,
                ..
            } => {
                self.associate(*fd)?;
                let mut ov = OverlappedOp::new(token);
                if let Some(off) = offset {
                    let at = *off + *done as u64;
                    ov.overlapped.Anonymous.Anonymous.Offset = at as u32;
                    ov.overlapped.Anonymous.Anonymous.OffsetHigh = (at >> 32) as u32;
                }
                let r = unsafe {
                    ReadFile(
                        *fd as HANDLE,
                        buf[*done..].as_mut_ptr() as *mut core::ffi::c_void,
                        (buf.len() - *done) as u32,
                        ptr::null_mut(),
                        &mut ov.overlapped,
                    )
                };
                let r = if r == 0 && unsafe { GetLastError() } != ERROR_IO_PENDING {
                    SOCKET_ERROR
                } else {
                    0
                };
                Ok(self.pended(token, ov, r))
            }
            Operation::Write {
                fd,
                buf,
                offset,
                done,
                ..
            } => {
                self.associate(*fd)?;
                let mut ov = OverlappedOp::new(token);
                if let Some(off) = offset {
                    let at = *off + *done as u64;
                    ov.overlapped.Anonymous.Anonymous.Offset = at as u32;
                    ov.overlapped.Anonymous.Anonymous.OffsetHigh = (at >> 32) as u32;
                }
                let r = unsafe {
                    WriteFile(
                        *fd as HANDLE,
                        buf[*done..].as_ptr(),
                        (buf.len() - *done) as u32,
                        ptr::null_mut(),
                        &mut ov.overlapped,
                    )
                };
                let r = if r == 0 && unsafe { GetLastError() } != ERROR_IO_PENDING {
                    SOCKET_ERROR
                } else {
                    0
                };
                Ok(self.pended(token, ov, r))
            }
            Operation::Recv { sock, buf } => {
                self.associate(*sock)?;
                let mut ov = OverlappedOp::new(token);
                let wsabuf = WSABUF {
                    len: buf.len() as u32,
                    buf: buf.as_mut_ptr(),
                };
                let mut flags = 0u32;
                let r = unsafe {
                    WSARecv(
                        *sock as SOCKET,
                        &wsabuf,
                        1,
                        ptr::null_mut(),
                        &mut flags,
                        &mut ov.overlapped,
                        None,
                    )
                };
                Ok(self.pended(token, ov, r))
            }
            Operation::Send {
                sock,
                buf,
                to,
                done,
                ..
            } => {
                self.associate(*sock)?;
                let mut ov = OverlappedOp::new(token);
                let wsabuf = WSABUF {
                    len: (buf.len() - *done) as u32,
                    buf: buf[*done..].as_ptr() as *mut u8,
                };
                let r = match to {
                    Some(addr) => unsafe {
                        WSASendTo(
                            *sock as SOCKET,
                            &wsabuf,
                            1,
                            ptr::null_mut(),
                            0,
                            addr.as_ptr() as *const SOCKADDR,
                            addr.len() as i32,
                            &mut ov.overlapped,
                            None,
                        )
                    },
                    None => unsafe {
                        WSASend(
                            *sock as SOCKET,
                            &wsabuf,
                            1,
                            ptr::null_mut(),
                            0,
                            &mut ov.overlapped,
                            None,
                        )
                    },
                };
                Ok(self.pended(token, ov, r))
            }
            Operation::Poll { fd, interest, .. } => {
                self.associate(*fd)?;
                match interest {
                    Interest::Read => {
                        // zero-byte receive: completes when data arrives
                        let mut ov = OverlappedOp::new(token);
                        let wsabuf = WSABUF {
                            len: 0,
                            buf: ptr::null_mut(),
                        };
                        let mut flags = 0u32;
                        let r = unsafe {
                            WSARecv(
                                *fd as SOCKET,
                                &wsabuf,
                                1,
                                ptr::null_mut(),
                                &mut flags,
                                &mut ov.overlapped,
                                None,
                            )
                        };
                        Ok(self.pended(token, ov, r))
                    }
                    Interest::Write => {
                        self.synthesized.push_back((token, 0));
                        Ok(SubmitResult::Queued)
                    }
                }
            }
            Operation::Timeout { .. } | Operation::NextTick | Operation::PollRemove { .. } => {
                unreachable!("operation is handled outside the kernel")
            }
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

        let millis = match wait {
            Some(d) => d.as_millis().min(u32::MAX as u128 - 1) as u32,
            None => u32::MAX, // INFINITE
        };
        let mut entries: Vec<OVERLAPPED_ENTRY> = vec![unsafe { mem::zeroed() }; ENTRY_CAPACITY];
        let mut count = 0u32;
        let r = unsafe {
            GetQueuedCompletionStatusEx(
                self.port,
                entries.as_mut_ptr(),
                ENTRY_CAPACITY as u32,
                &mut count,
                millis,
                0,
            )
        };
        if r == 0 {
            let err = io::Error::last_os_error();
            // WAIT_TIMEOUT
            if err.raw_os_error() == Some(258) {
                return Ok(());
            }
            return Err(err);
        }

        for entry in entries.iter().take(count as usize) {
            if entry.lpOverlapped.is_null() {
                continue;
            }
            let token = unsafe { (*(entry.lpOverlapped as *const OverlappedOp)).token };
            let ov = match self.inflight.remove(&token) {
                Some(ov) => ov,
                None => continue,
            };
            let comp = match pool.get_mut(token) {
                Some(comp) => comp,
                None => continue,
            };
            let status = ov.overlapped.Internal as u32;
            if status != 0 {
                let err = unsafe {
                    windows_sys::Win32::Foundation::RtlNtStatusToDosError(status as i32)
                };
                completed.push_back((token, -(err as i32)));
                continue;
            }
            let transferred = entry.dwNumberOfBytesTransferred as i32;
            match &mut comp.op {
                Operation::Accept { sock, accepted } => {
                    if let Some(client) = accepted {
                        let listener = *sock as SOCKET;
                        unsafe {
                            setsockopt(
                                *client as SOCKET,
                                SOL_SOCKET,
                                SO_UPDATE_ACCEPT_CONTEXT,
                                &listener as *const _ as *const u8,
                                mem::size_of::<SOCKET>() as i32,
                            );
                        }
                    }
                    completed.push_back((token, 0));
                }
                Operation::Connect { sock, .. } => {
                    unsafe {
                        setsockopt(
                            *sock as SOCKET,
                            SOL_SOCKET,
                            SO_UPDATE_CONNECT_CONTEXT,
                            ptr::null(),
                            0,
                        );
                    }
                    completed.push_back((token, 0));
                }
                Operation::Poll { .. } => completed.push_back((token, 0)),
                _ => completed.push_back((token, transferred)),
            }
        }
        Ok(())
    }

    fn cancel(&mut self, token: Token, comp: &mut Completion) -> io::Result<()> {
        let handle = match &comp.op {
            Operation::Accept { sock, .. }
            | Operation::Connect { sock, .. }
            | Operation::Recv { sock, .. }
            | Operation::Send { sock, .. }
            | Operation::Close { sock } => *sock as HANDLE,
            Operation::Read { fd, .. } | Operation::Write { fd, .. } => *fd as HANDLE,
            Operation::Poll { fd, .. } => *fd as HANDLE,
            _ => return Ok(()),
        };
        if let Some(ov) = self.inflight.get_mut(&token) {
            unsafe {
                CancelIoEx(handle, &ov.overlapped);
            }
        }
        Ok(())
    }
}
