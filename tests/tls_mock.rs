//! HTTPS plumbing driven by a null-cipher provider
//!
//! The provider passes bytes through unencrypted but behaves like a
//! real non-blocking TLS stack: a scripted handshake that wants the
//! socket readable, then writable, then finishes, and send/recv that
//! report WantRead/WantWrite on a pushed-back socket.

use std::cell::{Cell, RefCell};
use std::io::{self, Read, Write};
use std::mem::ManuallyDrop;
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::thread;

use riptide::aio::EventLoop;
use riptide::dns::Resolver;
use riptide::http::{Body, HttpClient, HttpError, Response};
use riptide::net::RawSock;
use riptide::tls::{Provider, Session, TlsStatus};

struct NullSession {
    // the socket is owned by the connection; never close it from here
    stream: ManuallyDrop<TcpStream>,
    script: Vec<TlsStatus>,
    connect_calls: Rc<Cell<usize>>,
}

#[cfg(unix)]
fn stream_from(sock: RawSock) -> TcpStream {
    use std::os::fd::FromRawFd;
    unsafe { TcpStream::from_raw_fd(sock) }
}

#[cfg(windows)]
fn stream_from(sock: RawSock) -> TcpStream {
    use std::os::windows::io::FromRawSocket;
    unsafe { TcpStream::from_raw_socket(sock) }
}

impl Session for NullSession {
    fn connect(&mut self) -> TlsStatus {
        self.connect_calls.set(self.connect_calls.get() + 1);
        let status = if self.script.is_empty() {
            TlsStatus::Done
        } else {
            self.script.remove(0)
        };
        if status == TlsStatus::Done {
            // consume the one-byte "server hello" the test server sends;
            // its arrival is what satisfied the WantRead poll
            let mut hello = [0u8; 1];
            if self.stream.read_exact(&mut hello).is_err() {
                return TlsStatus::Fatal;
            }
        }
        status
    }

    fn send(&mut self, bytes: &[u8]) -> (usize, TlsStatus) {
        match self.stream.write(bytes) {
            Ok(n) => (n, TlsStatus::Done),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => (0, TlsStatus::WantWrite),
            Err(_) => (0, TlsStatus::Fatal),
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> (usize, TlsStatus) {
        match self.stream.read(buf) {
            Ok(n) => (n, TlsStatus::Done),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => (0, TlsStatus::WantRead),
            Err(_) => (0, TlsStatus::Fatal),
        }
    }
}

struct NullProvider {
    connect_calls: Rc<Cell<usize>>,
}

impl Provider for NullProvider {
    fn session(&self, socket: RawSock, host: &str) -> io::Result<Box<dyn Session>> {
        assert_eq!(host, "127.0.0.1");
        Ok(Box::new(NullSession {
            stream: ManuallyDrop::new(stream_from(socket)),
            script: vec![TlsStatus::WantRead, TlsStatus::WantWrite, TlsStatus::Done],
            connect_calls: self.connect_calls.clone(),
        }))
    }
}

#[test]
fn handshake_is_driven_by_readiness_polls() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        // fake "server hello": gives the WantRead poll something to see
        stream.write_all(b"!").unwrap();
        let mut buf = [0u8; 4096];
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let n = stream.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
        }
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\nsecure")
            .unwrap();
        head
    });

    let connect_calls = Rc::new(Cell::new(0));
    let provider = Rc::new(NullProvider {
        connect_calls: connect_calls.clone(),
    });

    let mut lp = EventLoop::new().unwrap();
    let client = HttpClient::with_tls(Resolver::new(), provider);

    let seen: Rc<RefCell<Option<Result<Response, HttpError>>>> = Rc::new(RefCell::new(None));
    let slot = seen.clone();
    client
        .get(
            &mut lp,
            &format!("https://127.0.0.1:{}/", port),
            move |_, result| *slot.borrow_mut() = Some(result),
        )
        .unwrap();
    lp.run().unwrap();

    // WantRead, WantWrite, then Done: two polls, three connect steps
    assert_eq!(connect_calls.get(), 3);

    let seen = seen.borrow();
    let response = seen.as_ref().unwrap().as_ref().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, Body::Bytes(b"secure".to_vec()));

    let head = String::from_utf8(server.join().unwrap()).unwrap();
    assert!(head.starts_with("GET / HTTP/1.1\r\n"));
}
