//! connection state machine and request queue
//!
//! A connection dials lazily on its first request and then works its
//! queue strictly in order: serialize and send the head, send the body,
//! scan the response, hand it to the callback, move on. The response
//! body is always fully drained before the next request starts. A
//! transport failure fails the active request with the mapped error and
//! every queued request behind it; a parse failure fails the active
//! request and, since connections are not reused after damage, retires
//! the connection as well.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::aio::{AioError, EventLoop, Interest};
use crate::dns::Resolver;
use crate::http::headers::{self, Cookie};
use crate::http::response::{self, Framing};
use crate::http::{Body, Headers, HttpError, Request, Response, Scheme, Url};
use crate::net::RawSock;
use crate::scan::Scanner;
use crate::tls;

const RECV_CHUNK: usize = 8 * 1024;

type RequestCb = Box<dyn FnOnce(&mut EventLoop, Result<Response, HttpError>)>;

/// The HTTP client: a resolver plus an optional TLS provider. Cheap to
/// clone via the connections it creates; holds no sockets itself.
pub struct HttpClient {
    resolver: Resolver,
    provider: Option<Rc<dyn tls::Provider>>,
    max_header_line: usize,
}

impl HttpClient {
    pub fn new(resolver: Resolver) -> HttpClient {
        HttpClient {
            resolver,
            provider: None,
            max_header_line: crate::scan::DEFAULT_MAX_TOKEN_SIZE,
        }
    }

    /// A client that can also speak HTTPS through `provider`.
    pub fn with_tls(resolver: Resolver, provider: Rc<dyn tls::Provider>) -> HttpClient {
        let mut client = HttpClient::new(resolver);
        client.provider = Some(provider);
        client
    }

    /// Bounds a single response header line; longer lines fail the
    /// request with a scan error.
    pub fn set_max_header_line(&mut self, max: usize) {
        self.max_header_line = max;
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// A fresh connection to the url's endpoint. Nothing is dialed
    /// until the first request is submitted.
    pub fn connection(&self, url: &Url) -> Result<Connection, HttpError> {
        let secure = url.scheme == Scheme::Https;
        if secure && self.provider.is_none() {
            return Err(HttpError::NoTlsProvider);
        }
        Ok(Connection {
            inner: Rc::new(RefCell::new(ConnInner {
                host: url.host.clone(),
                port: url.port,
                secure,
                state: ConnState::Pending,
                sock: None,
                tls: None,
                scanner: Scanner::with_max_token_size(self.max_header_line),
                recv_scratch: None,
                queue: VecDeque::new(),
                resolver: self.resolver.clone(),
                provider: self.provider.clone(),
            })),
        })
    }

    /// One-shot GET: parse, connect, request.
    pub fn get(
        &self,
        lp: &mut EventLoop,
        url: &str,
        cb: impl FnOnce(&mut EventLoop, Result<Response, HttpError>) + 'static,
    ) -> Result<Connection, HttpError> {
        let request = Request::get(url)?;
        let conn = self.connection(request.url())?;
        conn.request(lp, request, cb);
        Ok(conn)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnState {
    Pending,
    Connecting,
    Connected,
    Requesting,
    SentHeaders,
    SentRequest,
    Failed,
}

#[derive(Default)]
struct PartialResponse {
    status: u16,
    headers: Headers,
    cookies: Vec<Cookie>,
    body: Vec<u8>,
}

struct PendingRequest {
    request: Request,
    cb: Option<RequestCb>,
    response: PartialResponse,
}

impl PendingRequest {
    fn new(request: Request, cb: RequestCb) -> PendingRequest {
        PendingRequest {
            request,
            cb: Some(cb),
            response: PartialResponse::default(),
        }
    }
}

struct ConnInner {
    host: String,
    port: u16,
    secure: bool,
    state: ConnState,
    sock: Option<RawSock>,
    tls: Option<Box<dyn tls::Session>>,
    scanner: Scanner,
    recv_scratch: Option<Vec<u8>>,
    /// Front is the active request; the rest wait their turn.
    queue: VecDeque<PendingRequest>,
    resolver: Resolver,
    provider: Option<Rc<dyn tls::Provider>>,
}

/// One connection to one endpoint, owning a FIFO of requests. Clones
/// share the connection.
#[derive(Clone)]
pub struct Connection {
    inner: Rc<RefCell<ConnInner>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").finish_non_exhaustive()
    }
}

impl Connection {
    /// Queues `request`; the callback fires exactly once with the
    /// response or the error that ended it. On a connection that has
    /// already failed the callback runs immediately with
    /// `ConnectRefused`.
    pub fn request(
        &self,
        lp: &mut EventLoop,
        request: Request,
        cb: impl FnOnce(&mut EventLoop, Result<Response, HttpError>) + 'static,
    ) {
        let state = self.inner.borrow().state;
        match state {
            ConnState::Failed => {
                cb(lp, Err(HttpError::Transport(AioError::ConnectRefused)));
            }
            ConnState::Pending => {
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.queue.push_back(PendingRequest::new(request, Box::new(cb)));
                    inner.state = ConnState::Connecting;
                }
                start_connect(self.clone(), lp);
            }
            ConnState::Connected => {
                let first = {
                    let mut inner = self.inner.borrow_mut();
                    inner.queue.push_back(PendingRequest::new(request, Box::new(cb)));
                    inner.queue.len() == 1
                };
                if first {
                    process_queue(self.clone(), lp);
                }
            }
            ConnState::Connecting
            | ConnState::Requesting
            | ConnState::SentHeaders
            | ConnState::SentRequest => {
                self.inner
                    .borrow_mut()
                    .queue
                    .push_back(PendingRequest::new(request, Box::new(cb)));
            }
        }
    }

    /// Retires the connection: closes the socket and fails everything
    /// still queued with `ConnectionClosed`.
    pub fn close(&self, lp: &mut EventLoop) {
        fail_connection(
            self.clone(),
            lp,
            HttpError::Transport(AioError::ConnectionClosed),
        );
    }
}

// ---- dialing ---------------------------------------------------------

fn start_connect(conn: Connection, lp: &mut EventLoop) {
    let (resolver, host, port) = {
        let inner = conn.inner.borrow();
        (inner.resolver.clone(), inner.host.clone(), inner.port)
    };
    log::debug!("dialing {}:{}", host, port);

    resolver.resolve(lp, &host, move |lp, result| {
        let answer = match result {
            Ok(answer) => answer,
            Err(err) => {
                fail_connection(conn, lp, HttpError::Dns(err));
                return;
            }
        };
        let endpoint = SocketAddr::new(answer.addr, port);
        let on_connected = conn.clone();
        lp.connect(endpoint, move |lp, result| match result {
            Ok(sock) => {
                on_connected.inner.borrow_mut().sock = Some(sock);
                establish(on_connected, lp);
            }
            Err(err) => fail_connection(on_connected, lp, HttpError::Transport(err)),
        });
    });
}

fn establish(conn: Connection, lp: &mut EventLoop) {
    let secure = conn.inner.borrow().secure;
    if !secure {
        conn.inner.borrow_mut().state = ConnState::Connected;
        process_queue(conn, lp);
        return;
    }

    let created = {
        let inner = conn.inner.borrow();
        match (&inner.provider, inner.sock) {
            (Some(provider), Some(sock)) => provider.session(sock, &inner.host).map(Some),
            _ => Ok(None),
        }
    };
    match created {
        Ok(Some(session)) => {
            conn.inner.borrow_mut().tls = Some(session);
            drive_handshake(conn, lp);
        }
        Ok(None) => fail_connection(conn, lp, HttpError::NoTlsProvider),
        Err(err) => fail_connection(conn, lp, HttpError::Transport(err.into())),
    }
}

/// Steps the TLS handshake, parking on a one-shot readiness poll for
/// every WantRead / WantWrite until the provider reports done.
fn drive_handshake(conn: Connection, lp: &mut EventLoop) {
    let status = {
        let mut inner = conn.inner.borrow_mut();
        match inner.tls.as_mut() {
            Some(tls) => tls.connect(),
            None => return,
        }
    };
    match status {
        tls::TlsStatus::Done => {
            log::debug!("TLS handshake complete");
            conn.inner.borrow_mut().state = ConnState::Connected;
            process_queue(conn, lp);
        }
        tls::TlsStatus::WantRead | tls::TlsStatus::WantWrite => {
            let interest = if status == tls::TlsStatus::WantRead {
                Interest::Read
            } else {
                Interest::Write
            };
            let sock = match conn.inner.borrow().sock {
                Some(sock) => sock,
                None => return,
            };
            let mut slot = Some(conn);
            lp.poll(sock, interest, false, move |lp, result| {
                if let Some(conn) = slot.take() {
                    match result {
                        Ok(()) => drive_handshake(conn, lp),
                        Err(err) => fail_connection(conn, lp, HttpError::Transport(err)),
                    }
                }
            });
        }
        tls::TlsStatus::Shutdown => fail_connection(conn, lp, HttpError::ControlledShutdown),
        tls::TlsStatus::Fatal => fail_connection(conn, lp, HttpError::FatalShutdown),
    }
}

// ---- request processing ----------------------------------------------

fn process_queue(conn: Connection, lp: &mut EventLoop) {
    let head = {
        let mut inner = conn.inner.borrow_mut();
        if inner.state != ConnState::Connected {
            return;
        }
        let front = match inner.queue.front() {
            Some(front) => front,
            None => return,
        };
        let head = front.request.serialize_head();
        inner.state = ConnState::Requesting;
        inner.scanner.reset();
        head
    };

    send_bytes(conn, lp, head, |lp, conn, result| {
        if let Err(err) = result {
            fail_active(conn, lp, err);
            return;
        }
        let body = {
            let mut inner = conn.inner.borrow_mut();
            inner.state = ConnState::SentHeaders;
            inner
                .queue
                .front()
                .map(|front| front.request.body.clone())
                .unwrap_or_default()
        };
        if body.is_empty() {
            conn.inner.borrow_mut().state = ConnState::SentRequest;
            read_response(conn, lp);
        } else {
            send_bytes(conn, lp, body, |lp, conn, result| {
                if let Err(err) = result {
                    fail_active(conn, lp, err);
                    return;
                }
                conn.inner.borrow_mut().state = ConnState::SentRequest;
                read_response(conn, lp);
            });
        }
    });
}

// ---- response parsing ------------------------------------------------

fn read_response(conn: Connection, lp: &mut EventLoop) {
    scan_token(conn, lp, |lp, conn, result| match result {
        Err(err) => fail_active(conn, lp, err),
        // one empty line ahead of the status line is tolerated
        Ok(line) if line.is_empty() => scan_token(conn, lp, |lp, conn, result| match result {
            Err(err) => fail_active(conn, lp, err),
            Ok(line) => handle_status_line(conn, lp, line),
        }),
        Ok(line) => handle_status_line(conn, lp, line),
    });
}

fn handle_status_line(conn: Connection, lp: &mut EventLoop, line: Vec<u8>) {
    match response::parse_status_line(&line) {
        Ok(status) => {
            with_active(&conn, |pending| pending.response.status = status);
            read_header_lines(conn, lp);
        }
        Err(err) => fail_active(conn, lp, err),
    }
}

fn read_header_lines(conn: Connection, lp: &mut EventLoop) {
    scan_token(conn, lp, |lp, conn, result| {
        let line = match result {
            Ok(line) => line,
            Err(err) => {
                fail_active(conn, lp, err);
                return;
            }
        };
        if line.is_empty() {
            finish_headers(conn, lp);
            return;
        }
        match response::parse_header_line(&line) {
            Ok((name, value)) => {
                if name == "set-cookie" {
                    match headers::parse_set_cookie(&value) {
                        Ok(cookie) => {
                            with_active(&conn, |pending| pending.response.cookies.push(cookie))
                        }
                        Err(err) => {
                            fail_active(conn, lp, err);
                            return;
                        }
                    }
                } else {
                    with_active(&conn, |pending| {
                        pending.response.headers.append(&name, value);
                    });
                }
                read_header_lines(conn, lp);
            }
            Err(err) => fail_active(conn, lp, err),
        }
    });
}

fn finish_headers(conn: Connection, lp: &mut EventLoop) {
    let framing = {
        let inner = conn.inner.borrow();
        match inner.queue.front() {
            Some(front) => response::framing(&front.response.headers),
            None => return,
        }
    };
    match framing {
        Err(err) => fail_active(conn, lp, err),
        Ok(Framing::Chunked) => read_chunk_size(conn, lp),
        Ok(Framing::Length(0)) => complete_response(conn, lp),
        Ok(Framing::Length(n)) => {
            if n > max_body(&conn) {
                fail_active(conn, lp, HttpError::TooLong);
                return;
            }
            conn.inner.borrow_mut().scanner.scan_bytes(n);
            scan_token(conn, lp, |lp, conn, result| match result {
                Ok(bytes) => {
                    with_active(&conn, |pending| pending.response.body = bytes);
                    complete_response(conn, lp);
                }
                Err(err) => fail_active(conn, lp, err),
            });
        }
        Ok(Framing::UntilClose) => read_until_close(conn, lp),
    }
}

fn read_chunk_size(conn: Connection, lp: &mut EventLoop) {
    scan_token(conn, lp, |lp, conn, result| {
        let line = match result {
            Ok(line) => line,
            Err(err) => {
                fail_active(conn, lp, err);
                return;
            }
        };
        match response::parse_chunk_size(&line) {
            Ok(0) => read_trailers(conn, lp),
            Ok(n) => {
                let total = {
                    let inner = conn.inner.borrow();
                    inner
                        .queue
                        .front()
                        .map(|front| front.response.body.len() + n)
                        .unwrap_or(0)
                };
                if total > max_body(&conn) {
                    fail_active(conn, lp, HttpError::TooLong);
                    return;
                }
                conn.inner.borrow_mut().scanner.scan_bytes(n);
                scan_token(conn, lp, |lp, conn, result| match result {
                    Ok(bytes) => {
                        with_active(&conn, |pending| {
                            pending.response.body.extend_from_slice(&bytes)
                        });
                        // every chunk is terminated by its own CRLF
                        scan_token(conn, lp, |lp, conn, result| match result {
                            Ok(line) if line.is_empty() => read_chunk_size(conn, lp),
                            Ok(_) => fail_active(conn, lp, HttpError::InvalidChunkSize),
                            Err(err) => fail_active(conn, lp, err),
                        });
                    }
                    Err(err) => fail_active(conn, lp, err),
                });
            }
            Err(err) => fail_active(conn, lp, err),
        }
    });
}

fn read_trailers(conn: Connection, lp: &mut EventLoop) {
    scan_token(conn, lp, |lp, conn, result| {
        let line = match result {
            Ok(line) => line,
            Err(err) => {
                fail_active(conn, lp, err);
                return;
            }
        };
        if line.is_empty() {
            with_active(&conn, |pending| {
                response::strip_chunked(&mut pending.response.headers)
            });
            complete_response(conn, lp);
            return;
        }
        match response::parse_header_line(&line) {
            Ok((name, value)) => {
                if response::trailer_allowed(&name) {
                    with_active(&conn, |pending| {
                        pending.response.headers.append(&name, value);
                    });
                } else {
                    log::debug!("dropping trailer header {:?}", name);
                }
                read_trailers(conn, lp);
            }
            Err(_) => fail_active(conn, lp, HttpError::InvalidTrailerHeader),
        }
    });
}

fn read_until_close(conn: Connection, lp: &mut EventLoop) {
    let outcome = {
        let mut inner = conn.inner.borrow_mut();
        let rest = inner.scanner.take_rest();
        let at_eof = inner.scanner.at_eof();
        let front = match inner.queue.front_mut() {
            Some(front) => front,
            None => return,
        };
        front.response.body.extend_from_slice(&rest);
        let max = front.request.max_response_len.unwrap_or(usize::MAX);
        if front.response.body.len() > max {
            Some(Err(HttpError::TooLong))
        } else if at_eof {
            Some(Ok(()))
        } else {
            None
        }
    };
    match outcome {
        Some(Err(err)) => fail_active(conn, lp, err),
        Some(Ok(())) => complete_response(conn, lp),
        None => fill(conn, lp, |lp, conn, result| match result {
            Ok(()) => read_until_close(conn, lp),
            Err(err) => fail_active(conn, lp, err),
        }),
    }
}

fn complete_response(conn: Connection, lp: &mut EventLoop) {
    let (cb, response) = {
        let mut inner = conn.inner.borrow_mut();
        let mut pending = match inner.queue.pop_front() {
            Some(pending) => pending,
            None => return,
        };
        inner.state = ConnState::Connected;

        let PartialResponse {
            status,
            mut headers,
            cookies,
            body,
        } = pending.response;

        let form = headers
            .get("content-type")
            .map(|ct| {
                ct.split(';')
                    .next()
                    .unwrap_or("")
                    .trim()
                    .eq_ignore_ascii_case("application/x-www-form-urlencoded")
            })
            .unwrap_or(false);
        let body = if form {
            Body::Form(response::decode_form(&body))
        } else {
            Body::Bytes(body)
        };
        headers.freeze();

        let cb = match pending.cb.take() {
            Some(cb) => cb,
            None => return,
        };
        (
            cb,
            Response {
                status,
                headers,
                cookies,
                body,
            },
        )
    };
    log::debug!("request completed with status {}", response.status);
    cb(lp, Ok(response));
    process_queue(conn, lp);
}

// ---- failure ---------------------------------------------------------

/// Fails the active request with `err` and everything queued behind it
/// with `ConnectionClosed`, then retires the connection.
fn fail_active(conn: Connection, lp: &mut EventLoop, err: HttpError) {
    log::warn!("request failed: {}", err);
    let (active_cb, rest, sock) = {
        let mut inner = conn.inner.borrow_mut();
        inner.state = ConnState::Failed;
        inner.tls = None;
        let sock = inner.sock.take();
        let active_cb = inner.queue.pop_front().and_then(|mut p| p.cb.take());
        let rest: Vec<RequestCb> = inner
            .queue
            .drain(..)
            .filter_map(|mut p| p.cb.take())
            .collect();
        (active_cb, rest, sock)
    };
    if let Some(sock) = sock {
        lp.close(sock, |_, _| {});
    }
    if let Some(cb) = active_cb {
        cb(lp, Err(err));
    }
    for cb in rest {
        cb(lp, Err(HttpError::Transport(AioError::ConnectionClosed)));
    }
}

/// Fails every queued request with the same error; used when the dial
/// itself (resolve, connect, TLS) never produced a usable connection.
fn fail_connection(conn: Connection, lp: &mut EventLoop, err: HttpError) {
    log::warn!("connection failed: {}", err);
    let (cbs, sock) = {
        let mut inner = conn.inner.borrow_mut();
        inner.state = ConnState::Failed;
        inner.tls = None;
        let sock = inner.sock.take();
        let cbs: Vec<RequestCb> = inner
            .queue
            .drain(..)
            .filter_map(|mut p| p.cb.take())
            .collect();
        (cbs, sock)
    };
    if let Some(sock) = sock {
        lp.close(sock, |_, _| {});
    }
    for cb in cbs {
        cb(lp, Err(err.clone()));
    }
}

// ---- plumbing --------------------------------------------------------

fn with_active(conn: &Connection, f: impl FnOnce(&mut PendingRequest)) {
    if let Some(front) = conn.inner.borrow_mut().queue.front_mut() {
        f(front);
    }
}

fn max_body(conn: &Connection) -> usize {
    conn.inner
        .borrow()
        .queue
        .front()
        .and_then(|front| front.request.max_response_len)
        .unwrap_or(usize::MAX)
}

/// Pulls the next scanner token, suspending on the socket as needed.
fn scan_token<K>(conn: Connection, lp: &mut EventLoop, k: K)
where
    K: FnOnce(&mut EventLoop, Connection, Result<Vec<u8>, HttpError>) + 'static,
{
    let step = conn.inner.borrow_mut().scanner.next();
    match step {
        Ok(Some(token)) => k(lp, conn, Ok(token)),
        Ok(None) => fill(conn, lp, move |lp, conn, result| match result {
            Ok(()) => scan_token(conn, lp, k),
            Err(err) => k(lp, conn, Err(err)),
        }),
        Err(err) => k(lp, conn, Err(HttpError::Scan(err))),
    }
}

/// Reads once from the socket (through TLS when present) into the
/// scanner. EOF marks the scanner instead of erroring.
fn fill<K>(conn: Connection, lp: &mut EventLoop, k: K)
where
    K: FnOnce(&mut EventLoop, Connection, Result<(), HttpError>) + 'static,
{
    let secure = conn.inner.borrow().tls.is_some();
    if secure {
        tls_fill(conn, lp, k);
        return;
    }
    let (sock, buf) = {
        let mut inner = conn.inner.borrow_mut();
        let sock = match inner.sock {
            Some(sock) => sock,
            None => {
                drop(inner);
                k(lp, conn, Err(HttpError::Transport(AioError::ConnectionClosed)));
                return;
            }
        };
        let buf = inner
            .recv_scratch
            .take()
            .unwrap_or_else(|| vec![0u8; RECV_CHUNK]);
        (sock, buf)
    };
    lp.recv(sock, buf, move |lp, buf, result| {
        let outcome = match result {
            Ok(0) => {
                conn.inner.borrow_mut().scanner.set_eof();
                Ok(())
            }
            Ok(n) => {
                conn.inner.borrow_mut().scanner.feed(&buf[..n]);
                Ok(())
            }
            Err(err) => Err(HttpError::Transport(err)),
        };
        conn.inner.borrow_mut().recv_scratch = Some(buf);
        k(lp, conn, outcome);
    });
}

fn tls_fill<K>(conn: Connection, lp: &mut EventLoop, k: K)
where
    K: FnOnce(&mut EventLoop, Connection, Result<(), HttpError>) + 'static,
{
    let mut scratch = [0u8; RECV_CHUNK];
    let step = {
        let mut inner = conn.inner.borrow_mut();
        inner.tls.as_mut().map(|tls| tls.recv(&mut scratch))
    };
    let (n, status) = match step {
        Some(step) => step,
        None => {
            k(lp, conn, Err(HttpError::Transport(AioError::ConnectionClosed)));
            return;
        }
    };
    if n > 0 {
        conn.inner.borrow_mut().scanner.feed(&scratch[..n]);
        k(lp, conn, Ok(()));
        return;
    }
    match status {
        tls::TlsStatus::Done | tls::TlsStatus::Shutdown => {
            // clean stream end, or the peer's close-notify
            conn.inner.borrow_mut().scanner.set_eof();
            k(lp, conn, Ok(()));
        }
        tls::TlsStatus::WantRead | tls::TlsStatus::WantWrite => {
            let interest = if status == tls::TlsStatus::WantRead {
                Interest::Read
            } else {
                Interest::Write
            };
            let sock_opt = conn.inner.borrow().sock;
            let sock = match sock_opt {
                Some(sock) => sock,
                None => {
                    k(lp, conn, Err(HttpError::Transport(AioError::ConnectionClosed)));
                    return;
                }
            };
            let mut slot = Some((conn, k));
            lp.poll(sock, interest, false, move |lp, result| {
                if let Some((conn, k)) = slot.take() {
                    match result {
                        Ok(()) => tls_fill(conn, lp, k),
                        Err(err) => k(lp, conn, Err(HttpError::Transport(err))),
                    }
                }
            });
        }
        tls::TlsStatus::Fatal => k(lp, conn, Err(HttpError::FatalShutdown)),
    }
}

/// Sends the whole buffer: `send_all` on plaintext connections, the
/// provider's `send` driven by readiness polls on TLS.
fn send_bytes<K>(conn: Connection, lp: &mut EventLoop, data: Vec<u8>, k: K)
where
    K: FnOnce(&mut EventLoop, Connection, Result<(), HttpError>) + 'static,
{
    let secure = conn.inner.borrow().tls.is_some();
    if secure {
        tls_send(conn, lp, data, 0, k);
        return;
    }
    let sock_opt = conn.inner.borrow().sock;
    let sock = match sock_opt {
        Some(sock) => sock,
        None => {
            k(lp, conn, Err(HttpError::Transport(AioError::ConnectionClosed)));
            return;
        }
    };
    lp.send_all(sock, data, move |lp, _buf, result| match result {
        Ok(_) => k(lp, conn, Ok(())),
        Err(err) => k(lp, conn, Err(HttpError::Transport(err))),
    });
}

fn tls_send<K>(conn: Connection, lp: &mut EventLoop, data: Vec<u8>, done: usize, k: K)
where
    K: FnOnce(&mut EventLoop, Connection, Result<(), HttpError>) + 'static,
{
    let step = {
        let mut inner = conn.inner.borrow_mut();
        inner.tls.as_mut().map(|tls| tls.send(&data[done..]))
    };
    let (n, status) = match step {
        Some(step) => step,
        None => {
            k(lp, conn, Err(HttpError::Transport(AioError::ConnectionClosed)));
            return;
        }
    };
    let done = done + n;
    match status {
        tls::TlsStatus::Done => {
            if done >= data.len() {
                k(lp, conn, Ok(()));
            } else if n == 0 {
                k(lp, conn, Err(HttpError::WriteFailed));
            } else {
                tls_send(conn, lp, data, done, k);
            }
        }
        tls::TlsStatus::WantRead | tls::TlsStatus::WantWrite => {
            let interest = if status == tls::TlsStatus::WantRead {
                Interest::Read
            } else {
                Interest::Write
            };
            let sock_opt = conn.inner.borrow().sock;
            let sock = match sock_opt {
                Some(sock) => sock,
                None => {
                    k(lp, conn, Err(HttpError::Transport(AioError::ConnectionClosed)));
                    return;
                }
            };
            let mut slot = Some((conn, k, data));
            lp.poll(sock, interest, false, move |lp, result| {
                if let Some((conn, k, data)) = slot.take() {
                    match result {
                        Ok(()) => tls_send(conn, lp, data, done, k),
                        Err(err) => k(lp, conn, Err(HttpError::Transport(err))),
                    }
                }
            });
        }
        tls::TlsStatus::Shutdown => k(lp, conn, Err(HttpError::ControlledShutdown)),
        tls::TlsStatus::Fatal => k(lp, conn, Err(HttpError::FatalShutdown)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idle_connection(state: ConnState) -> Connection {
        Connection {
            inner: Rc::new(RefCell::new(ConnInner {
                host: "example.test".to_string(),
                port: 80,
                secure: false,
                state,
                sock: None,
                tls: None,
                scanner: Scanner::new(),
                recv_scratch: None,
                queue: VecDeque::new(),
                resolver: Resolver::new(),
                provider: None,
            })),
        }
    }

    #[test]
    fn requests_on_a_failed_connection_fail_synchronously() {
        let mut lp = EventLoop::new().unwrap();
        let conn = idle_connection(ConnState::Failed);

        let seen = Rc::new(RefCell::new(None));
        let slot = seen.clone();
        conn.request(
            &mut lp,
            Request::get("http://example.test/").unwrap(),
            move |_, result| *slot.borrow_mut() = Some(result),
        );
        // no tick: the failed-state contract is synchronous
        assert_eq!(
            *seen.borrow(),
            Some(Err(HttpError::Transport(AioError::ConnectRefused)))
        );
    }

    #[test]
    fn https_without_a_provider_is_rejected_at_construction() {
        let client = HttpClient::new(Resolver::new());
        let url = Url::parse("https://example.test/").unwrap();
        assert_eq!(
            client.connection(&url).unwrap_err(),
            HttpError::NoTlsProvider
        );
    }

    #[test]
    fn queue_preserves_submission_order() {
        let mut lp = EventLoop::new().unwrap();
        let conn = idle_connection(ConnState::Connecting);
        for path in ["/a", "/b", "/c"] {
            let url = format!("http://example.test{}", path);
            conn.request(&mut lp, Request::get(&url).unwrap(), |_, _| {});
        }
        let inner = conn.inner.borrow();
        let paths: Vec<String> = inner
            .queue
            .iter()
            .map(|pending| pending.request.url().path.clone())
            .collect();
        assert_eq!(paths, vec!["/a", "/b", "/c"]);
    }
}
