//! end-to-end HTTP scenarios against scripted loopback servers

use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::thread;

use riptide::aio::{AioError, EventLoop};
use riptide::dns::Resolver;
use riptide::http::{request::USER_AGENT, Body, HttpClient, HttpError, Request, Response};

/// Reads one request off the stream: the head up to the blank line plus
/// however many body bytes its content-length declares.
fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    let mut byte = [0u8; 1];
    while !data.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => data.push(byte[0]),
            _ => return data,
        }
    }
    let head = String::from_utf8_lossy(&data).to_ascii_lowercase();
    let body_len = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);
    let mut body = vec![0u8; body_len];
    if body_len > 0 && stream.read_exact(&mut body).is_ok() {
        data.extend_from_slice(&body);
    }
    data
}

/// One connection, `responses.len()` request/response exchanges, then
/// close. Returns the port and a handle yielding the raw requests.
fn spawn_server(responses: Vec<Vec<u8>>) -> (u16, thread::JoinHandle<Vec<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        for response in responses {
            received.push(read_request(&mut stream));
            stream.write_all(&response).unwrap();
            stream.flush().unwrap();
        }
        received
    });
    (port, handle)
}

fn client() -> HttpClient {
    let _ = env_logger::builder().is_test(true).try_init();
    HttpClient::new(Resolver::new())
}

type Slot = Rc<RefCell<Vec<Result<Response, HttpError>>>>;

fn push_to(slot: &Slot) -> impl FnOnce(&mut EventLoop, Result<Response, HttpError>) + 'static {
    let slot = slot.clone();
    move |_, result| slot.borrow_mut().push(result)
}

#[test]
fn plain_get_with_auto_headers() {
    let (port, server) = spawn_server(vec![
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello".to_vec(),
    ]);
    let mut lp = EventLoop::new().unwrap();

    let results: Slot = Rc::new(RefCell::new(Vec::new()));
    client()
        .get(&mut lp, &format!("http://127.0.0.1:{}/", port), push_to(&results))
        .unwrap();
    lp.run().unwrap();

    let results = results.borrow();
    let response = results[0].as_ref().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, Body::Bytes(b"hello".to_vec()));
    assert_eq!(response.headers.get("content-length"), Some("5"));
    assert!(response.headers.readonly());

    let requests = server.join().unwrap();
    let head = String::from_utf8_lossy(&requests[0]).to_string();
    assert!(head.starts_with("GET / HTTP/1.1\r\n"));
    assert!(head.contains("content-length: 0\r\n"));
    assert!(head.contains("accept: */*\r\n"));
    assert!(head.contains(&format!("user-agent: {}\r\n", USER_AGENT)));
    assert!(head.contains(&format!("host: 127.0.0.1:{}\r\n", port)));
}

#[test]
fn chunked_response_reassembles_and_strips_the_encoding() {
    let (port, server) = spawn_server(vec![
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
            .to_vec(),
    ]);
    let mut lp = EventLoop::new().unwrap();

    let results: Slot = Rc::new(RefCell::new(Vec::new()));
    client()
        .get(&mut lp, &format!("http://127.0.0.1:{}/", port), push_to(&results))
        .unwrap();
    lp.run().unwrap();

    let results = results.borrow();
    let response = results[0].as_ref().unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body, Body::Bytes(b"hello world".to_vec()));
    assert_eq!(response.headers.get("transfer-encoding"), None);
    server.join().unwrap();
}

#[test]
fn chunk_extensions_and_allowed_trailers() {
    let (port, server) = spawn_server(vec![
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nTrailer: x-checksum\r\n\r\n\
          4;name=value\r\nbody\r\n0\r\nx-checksum: abc\r\ncontent-length: 999\r\n\r\n"
            .to_vec(),
    ]);
    let mut lp = EventLoop::new().unwrap();

    let results: Slot = Rc::new(RefCell::new(Vec::new()));
    client()
        .get(&mut lp, &format!("http://127.0.0.1:{}/", port), push_to(&results))
        .unwrap();
    lp.run().unwrap();

    let results = results.borrow();
    let response = results[0].as_ref().unwrap();
    assert_eq!(response.body, Body::Bytes(b"body".to_vec()));
    assert_eq!(response.headers.get("x-checksum"), Some("abc"));
    // framing fields may not arrive as trailers; the trailer header goes too
    assert_eq!(response.headers.get("content-length"), None);
    assert_eq!(response.headers.get("trailer"), None);
    server.join().unwrap();
}

#[test]
fn leading_empty_line_before_the_status_line_is_tolerated() {
    let (port, server) = spawn_server(vec![
        b"\r\nHTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n".to_vec(),
    ]);
    let mut lp = EventLoop::new().unwrap();

    let results: Slot = Rc::new(RefCell::new(Vec::new()));
    client()
        .get(&mut lp, &format!("http://127.0.0.1:{}/", port), push_to(&results))
        .unwrap();
    lp.run().unwrap();

    assert_eq!(results.borrow()[0].as_ref().unwrap().status, 204);
    server.join().unwrap();
}

#[test]
fn body_without_length_runs_to_connection_close() {
    let (port, server) = spawn_server(vec![
        b"HTTP/1.1 200 OK\r\n\r\nstreamed until close".to_vec(),
    ]);
    let mut lp = EventLoop::new().unwrap();

    let results: Slot = Rc::new(RefCell::new(Vec::new()));
    client()
        .get(&mut lp, &format!("http://127.0.0.1:{}/", port), push_to(&results))
        .unwrap();
    lp.run().unwrap();

    let results = results.borrow();
    assert_eq!(
        results[0].as_ref().unwrap().body,
        Body::Bytes(b"streamed until close".to_vec())
    );
    server.join().unwrap();
}

#[test]
fn urlencoded_bodies_become_a_mapping() {
    let (port, server) = spawn_server(vec![
        b"HTTP/1.1 200 OK\r\nContent-Type: application/x-www-form-urlencoded; charset=utf-8\r\n\
          Content-Length: 23\r\n\r\na=1&plain&b=two%20words"
            .to_vec(),
    ]);
    let mut lp = EventLoop::new().unwrap();

    let results: Slot = Rc::new(RefCell::new(Vec::new()));
    client()
        .get(&mut lp, &format!("http://127.0.0.1:{}/", port), push_to(&results))
        .unwrap();
    lp.run().unwrap();

    let results = results.borrow();
    let response = results[0].as_ref().unwrap();
    let form = response.body.as_form().unwrap();
    assert_eq!(
        form,
        &[
            ("a".to_string(), "1".to_string()),
            ("plain".to_string(), String::new()),
            ("b".to_string(), "two words".to_string()),
        ]
    );
    server.join().unwrap();
}

#[test]
fn queued_requests_share_the_connection_in_order() {
    let (port, server) = spawn_server(vec![
        b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none".to_vec(),
        b"HTTP/1.1 201 Created\r\nContent-Length: 3\r\n\r\ntwo".to_vec(),
    ]);
    let mut lp = EventLoop::new().unwrap();

    let url = format!("http://127.0.0.1:{}/", port);
    let client = client();
    let conn = client
        .connection(Request::get(&url).unwrap().url())
        .unwrap();

    let results: Slot = Rc::new(RefCell::new(Vec::new()));
    let mut first = Request::get(&format!("http://127.0.0.1:{}/first", port)).unwrap();
    first.body = b"abc".to_vec();
    conn.request(&mut lp, first, push_to(&results));
    let second = Request::get(&format!("http://127.0.0.1:{}/second", port)).unwrap();
    conn.request(&mut lp, second, push_to(&results));

    lp.run().unwrap();

    {
        let results = results.borrow();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_ref().unwrap().status, 200);
        assert_eq!(results[0].as_ref().unwrap().body, Body::Bytes(b"one".to_vec()));
        assert_eq!(results[1].as_ref().unwrap().status, 201);
        assert_eq!(results[1].as_ref().unwrap().body, Body::Bytes(b"two".to_vec()));
    }
    conn.close(&mut lp);
    lp.run().unwrap();

    let requests = server.join().unwrap();
    assert!(requests[0].starts_with(b"GET /first "));
    assert!(String::from_utf8_lossy(&requests[0]).ends_with("abc"));
    assert!(requests[1].starts_with(b"GET /second "));
}

#[test]
fn queued_requests_on_an_unreachable_endpoint_all_refuse_in_order() {
    // bind then drop: nothing listens on this port afterwards
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let mut lp = EventLoop::new().unwrap();
    let url = format!("http://127.0.0.1:{}/", port);
    let client = client();
    let conn = client
        .connection(Request::get(&url).unwrap().url())
        .unwrap();

    let order: Rc<RefCell<Vec<(usize, Result<u16, HttpError>)>>> =
        Rc::new(RefCell::new(Vec::new()));
    for i in 0..3 {
        let slot = order.clone();
        conn.request(
            &mut lp,
            Request::get(&url).unwrap(),
            move |_, result| {
                slot.borrow_mut().push((i, result.map(|r| r.status)));
            },
        );
    }
    lp.run().unwrap();

    let order = order.borrow();
    assert_eq!(order.len(), 3);
    for (expected, (index, result)) in order.iter().enumerate() {
        assert_eq!(*index, expected);
        assert_eq!(
            *result,
            Err(HttpError::Transport(AioError::ConnectRefused)),
            "request {} got {:?}",
            expected,
            result
        );
    }
}

#[test]
fn oversized_bodies_fail_with_too_long() {
    let (port, server) = spawn_server(vec![
        b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n0123456789".to_vec(),
    ]);
    let mut lp = EventLoop::new().unwrap();

    let url = format!("http://127.0.0.1:{}/", port);
    let client = client();
    let conn = client
        .connection(Request::get(&url).unwrap().url())
        .unwrap();

    let results: Slot = Rc::new(RefCell::new(Vec::new()));
    let mut request = Request::get(&url).unwrap();
    request.max_response_len = Some(5);
    conn.request(&mut lp, request, push_to(&results));
    lp.run().unwrap();

    assert_eq!(
        results.borrow()[0].as_ref().unwrap_err(),
        &HttpError::TooLong
    );
    server.join().unwrap();
}
