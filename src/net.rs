//! socket construction and endpoint helpers shared by the runtime layers

use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

/// Raw socket handle as it flows through the event loop.
#[cfg(unix)]
pub type RawSock = std::os::fd::RawFd;
#[cfg(windows)]
pub type RawSock = std::os::windows::io::RawSocket;

/// Placeholder descriptor for completions that failed before a socket
/// existed.
#[cfg(unix)]
pub const INVALID_SOCK: RawSock = -1;
#[cfg(windows)]
pub const INVALID_SOCK: RawSock = RawSock::MAX;

fn domain_for(addr: &SocketAddr) -> Domain {
    match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    }
}

#[cfg(unix)]
fn into_raw(socket: Socket) -> RawSock {
    use std::os::fd::IntoRawFd;
    socket.into_raw_fd()
}

#[cfg(windows)]
fn into_raw(socket: Socket) -> RawSock {
    use std::os::windows::io::IntoRawSocket;
    socket.into_raw_socket()
}

/// A non-blocking TCP socket suitable for an asynchronous connect to `addr`.
pub fn tcp_socket(addr: &SocketAddr) -> io::Result<RawSock> {
    let socket = Socket::new(domain_for(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    Ok(into_raw(socket))
}

/// A non-blocking UDP socket of the same family as `addr`.
pub fn udp_socket(addr: &SocketAddr) -> io::Result<RawSock> {
    let socket = Socket::new(domain_for(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(into_raw(socket))
}

/// A non-blocking listener bound to `addr`, with address reuse enabled.
pub fn tcp_listener(addr: &SocketAddr) -> io::Result<RawSock> {
    let socket = Socket::new(domain_for(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(*addr))?;
    socket.listen(128)?;
    Ok(into_raw(socket))
}

pub(crate) fn sock_addr(addr: &SocketAddr) -> SockAddr {
    SockAddr::from(*addr)
}

/// Marks an inherited descriptor (e.g. from `accept`) non-blocking.
#[cfg(unix)]
pub(crate) fn set_nonblocking(sock: RawSock) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(sock, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(sock, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn set_nonblocking(sock: RawSock) -> io::Result<()> {
    use windows_sys::Win32::Networking::WinSock::{ioctlsocket, FIONBIO};
    let mut on: u32 = 1;
    if unsafe { ioctlsocket(sock as usize, FIONBIO, &mut on) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Peer address of a connected stream socket.
#[cfg(unix)]
pub(crate) fn peer_addr(sock: RawSock) -> io::Result<SocketAddr> {
    use std::os::fd::{FromRawFd, IntoRawFd};
    let stream = unsafe { std::net::TcpStream::from_raw_fd(sock) };
    let peer = stream.peer_addr();
    let _ = stream.into_raw_fd();
    peer
}

#[cfg(windows)]
pub(crate) fn peer_addr(sock: RawSock) -> io::Result<SocketAddr> {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    let stream = unsafe { std::net::TcpStream::from_raw_socket(sock) };
    let peer = stream.peer_addr();
    let _ = stream.into_raw_socket();
    peer
}

/// Locally bound address, if any.
#[cfg(unix)]
pub fn local_addr(sock: RawSock) -> io::Result<SocketAddr> {
    use std::os::fd::{FromRawFd, IntoRawFd};
    let stream = unsafe { std::net::TcpStream::from_raw_fd(sock) };
    let local = stream.local_addr();
    let _ = stream.into_raw_fd();
    local
}

#[cfg(windows)]
pub fn local_addr(sock: RawSock) -> io::Result<SocketAddr> {
    use std::os::windows::io::{FromRawSocket, IntoRawSocket};
    let stream = unsafe { std::net::TcpStream::from_raw_socket(sock) };
    let local = stream.local_addr();
    let _ = stream.into_raw_socket();
    local
}
