//! response types, line parsing and body framing

use crate::http::headers::Cookie;
use crate::http::{percent_decode, Headers, HttpError};

/// The assembled response body. Bodies declared as
/// `application/x-www-form-urlencoded` are decoded into pairs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Bytes(Vec<u8>),
    Form(Vec<(String, String)>),
}

impl Body {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Bytes(bytes) => Some(bytes),
            Body::Form(_) => None,
        }
    }

    pub fn as_form(&self) -> Option<&[(String, String)]> {
        match self {
            Body::Bytes(_) => None,
            Body::Form(pairs) => Some(pairs),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Body::Bytes(bytes) => bytes.len(),
            Body::Form(pairs) => pairs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One parsed response. Headers are read-only by the time user code
/// sees them.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub headers: Headers,
    pub cookies: Vec<Cookie>,
    pub body: Body,
}

impl Response {
    /// The declared content length, when the server sent one.
    pub fn content_length(&self) -> Result<usize, HttpError> {
        let value = self.headers.get("content-length").ok_or(HttpError::NoLength)?;
        value.trim().parse().map_err(|_| HttpError::InvalidLength)
    }
}

/// How the body bytes are framed, per RFC 7230 §3.3.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    Chunked,
    Length(usize),
    UntilClose,
}

/// Derives the framing from response headers: a transfer-encoding
/// ending in `chunked` wins; otherwise content-length; otherwise the
/// body runs to connection close (also when a transfer-encoding is
/// present but not chunked-final).
pub(crate) fn framing(headers: &Headers) -> Result<Framing, HttpError> {
    if let Some(te) = headers.get("transfer-encoding") {
        let last = te.rsplit(',').next().map(str::trim).unwrap_or("");
        if last.eq_ignore_ascii_case("chunked") {
            return Ok(Framing::Chunked);
        }
        return Ok(Framing::UntilClose);
    }
    if let Some(cl) = headers.get("content-length") {
        let n: usize = cl.trim().parse().map_err(|_| HttpError::InvalidLength)?;
        return Ok(Framing::Length(n));
    }
    Ok(Framing::UntilClose)
}

/// Parses `HTTP/1.<minor> <status> <reason>`; only major version 1 is
/// accepted.
pub(crate) fn parse_status_line(line: &[u8]) -> Result<u16, HttpError> {
    let line = std::str::from_utf8(line).map_err(|_| HttpError::InvalidResponseVersion)?;
    let mut parts = line.splitn(3, ' ');

    let version = parts.next().ok_or(HttpError::InvalidResponseVersion)?;
    let version = version
        .strip_prefix("HTTP/")
        .ok_or(HttpError::InvalidResponseVersion)?;
    let major = version.split('.').next().unwrap_or("");
    if major != "1" {
        return Err(HttpError::InvalidResponseVersion);
    }
    match version.split_once('.') {
        Some((_, minor)) if minor.parse::<u8>().is_err() => {
            return Err(HttpError::InvalidResponseVersion)
        }
        _ => {}
    }

    let status = parts.next().ok_or(HttpError::InvalidResponseStatus)?;
    if status.len() != 3 {
        return Err(HttpError::InvalidResponseStatus);
    }
    status.parse().map_err(|_| HttpError::InvalidResponseStatus)
}

/// Parses one `name: value` header line.
pub(crate) fn parse_header_line(line: &[u8]) -> Result<(String, String), HttpError> {
    let line = std::str::from_utf8(line).map_err(|_| HttpError::InvalidResponseHeader)?;
    let (name, value) = line.split_once(':').ok_or(HttpError::InvalidResponseHeader)?;
    let name = name.trim();
    if name.is_empty() || !name.bytes().all(is_token_byte) {
        return Err(HttpError::InvalidResponseHeader);
    }
    Ok((name.to_ascii_lowercase(), value.trim().to_string()))
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Parses a chunk-size line; extensions after `;` are discarded.
pub(crate) fn parse_chunk_size(line: &[u8]) -> Result<usize, HttpError> {
    let line = std::str::from_utf8(line).map_err(|_| HttpError::InvalidChunkSize)?;
    let size = line.split(';').next().unwrap_or("").trim();
    if size.is_empty() {
        return Err(HttpError::InvalidChunkSize);
    }
    usize::from_str_radix(size, 16).map_err(|_| HttpError::InvalidChunkSize)
}

/// Whether a trailer header may be promoted into the header map.
/// Framing, routing and authentication fields may not arrive late.
pub(crate) fn trailer_allowed(name: &str) -> bool {
    !matches!(
        name,
        "transfer-encoding"
            | "content-length"
            | "content-encoding"
            | "content-type"
            | "content-range"
            | "host"
            | "cache-control"
            | "expect"
            | "max-forwards"
            | "pragma"
            | "range"
            | "te"
            | "trailer"
            | "authorization"
            | "cookie"
            | "set-cookie"
    )
}

/// Removes `chunked` from the transfer-encoding header once the body
/// has been de-chunked, and drops the `trailer` header.
pub(crate) fn strip_chunked(headers: &mut Headers) {
    if let Some(te) = headers.get("transfer-encoding") {
        let rest: Vec<&str> = te
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty() && !token.eq_ignore_ascii_case("chunked"))
            .collect();
        if rest.is_empty() {
            headers.remove("transfer-encoding");
        } else {
            headers.set("transfer-encoding", rest.join(", "));
        }
    }
    headers.remove("trailer");
}

/// Splits an urlencoded body into decoded pairs. A segment without `=`
/// maps the whole segment to the empty string; pairs with broken
/// percent escapes are dropped.
pub(crate) fn decode_form(bytes: &[u8]) -> Vec<(String, String)> {
    let text = String::from_utf8_lossy(bytes);
    let mut pairs = Vec::new();
    for segment in text.split('&') {
        if segment.is_empty() {
            continue;
        }
        let (key, value) = match segment.split_once('=') {
            Some((key, value)) => (key, value),
            None => (segment, ""),
        };
        match (percent_decode(key), percent_decode(value)) {
            (Some(key), Some(value)) => pairs.push((key, value)),
            _ => log::warn!("dropping undecodable form pair: {:?}", segment),
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_lines() {
        assert_eq!(parse_status_line(b"HTTP/1.1 200 OK").unwrap(), 200);
        assert_eq!(parse_status_line(b"HTTP/1.0 404 Not Found").unwrap(), 404);
        // reason phrase is optional
        assert_eq!(parse_status_line(b"HTTP/1.1 204").unwrap(), 204);

        assert_eq!(
            parse_status_line(b"HTTP/2 200 OK").unwrap_err(),
            HttpError::InvalidResponseVersion
        );
        assert_eq!(
            parse_status_line(b"ICY 200 OK").unwrap_err(),
            HttpError::InvalidResponseVersion
        );
        assert_eq!(
            parse_status_line(b"HTTP/1.1 20 OK").unwrap_err(),
            HttpError::InvalidResponseStatus
        );
        assert_eq!(
            parse_status_line(b"HTTP/1.1 abc OK").unwrap_err(),
            HttpError::InvalidResponseStatus
        );
    }

    #[test]
    fn header_lines() {
        assert_eq!(
            parse_header_line(b"Content-Type: text/html").unwrap(),
            ("content-type".to_string(), "text/html".to_string())
        );
        assert_eq!(
            parse_header_line(b"X-Empty:").unwrap(),
            ("x-empty".to_string(), String::new())
        );
        assert_eq!(
            parse_header_line(b"no colon here").unwrap_err(),
            HttpError::InvalidResponseHeader
        );
        assert_eq!(
            parse_header_line(b"bad name: x").unwrap_err(),
            HttpError::InvalidResponseHeader
        );
    }

    #[test]
    fn framing_prefers_final_chunked() {
        let mut headers = Headers::new();
        headers.set("transfer-encoding", "gzip, chunked");
        headers.set("content-length", "10");
        assert_eq!(framing(&headers).unwrap(), Framing::Chunked);
    }

    #[test]
    fn framing_falls_back_to_length_then_close() {
        let mut headers = Headers::new();
        headers.set("content-length", "42");
        assert_eq!(framing(&headers).unwrap(), Framing::Length(42));

        let empty = Headers::new();
        assert_eq!(framing(&empty).unwrap(), Framing::UntilClose);

        let mut weird = Headers::new();
        weird.set("transfer-encoding", "gzip");
        assert_eq!(framing(&weird).unwrap(), Framing::UntilClose);
    }

    #[test]
    fn zero_content_length_is_a_length_not_an_error() {
        let mut headers = Headers::new();
        headers.set("content-length", "0");
        assert_eq!(framing(&headers).unwrap(), Framing::Length(0));
    }

    #[test]
    fn bad_content_length_is_invalid() {
        let mut headers = Headers::new();
        headers.set("content-length", "12abc");
        assert_eq!(framing(&headers).unwrap_err(), HttpError::InvalidLength);
    }

    #[test]
    fn chunk_sizes_with_extensions() {
        assert_eq!(parse_chunk_size(b"5").unwrap(), 5);
        assert_eq!(parse_chunk_size(b"1a3F").unwrap(), 0x1a3f);
        assert_eq!(parse_chunk_size(b"5;ext=1").unwrap(), 5);
        assert_eq!(parse_chunk_size(b"  5 ; a ; b").unwrap(), 5);
        assert_eq!(
            parse_chunk_size(b"xyz").unwrap_err(),
            HttpError::InvalidChunkSize
        );
        assert_eq!(
            parse_chunk_size(b";ext").unwrap_err(),
            HttpError::InvalidChunkSize
        );
    }

    #[test]
    fn chunked_is_stripped_from_transfer_encoding() {
        let mut headers = Headers::new();
        headers.set("transfer-encoding", "gzip, chunked");
        headers.set("trailer", "x-checksum");
        strip_chunked(&mut headers);
        assert_eq!(headers.get("transfer-encoding"), Some("gzip"));
        assert_eq!(headers.get("trailer"), None);

        let mut only = Headers::new();
        only.set("transfer-encoding", "chunked");
        strip_chunked(&mut only);
        assert_eq!(only.get("transfer-encoding"), None);
    }

    #[test]
    fn trailer_allowance() {
        assert!(trailer_allowed("x-checksum"));
        assert!(trailer_allowed("etag"));
        assert!(!trailer_allowed("content-length"));
        assert!(!trailer_allowed("transfer-encoding"));
        assert!(!trailer_allowed("set-cookie"));
    }

    #[test]
    fn form_decoding() {
        let pairs = decode_form(b"a=1&b=two+words&c%20d=x%2Fy");
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two words".to_string()),
                ("c d".to_string(), "x/y".to_string()),
            ]
        );
    }

    #[test]
    fn form_key_without_equals_maps_to_empty_string() {
        let pairs = decode_form(b"lonely&k=v");
        assert_eq!(
            pairs,
            vec![
                ("lonely".to_string(), String::new()),
                ("k".to_string(), "v".to_string()),
            ]
        );
    }

    #[test]
    fn broken_escapes_are_dropped() {
        let pairs = decode_form(b"ok=1&bad%zz=2");
        assert_eq!(pairs, vec![("ok".to_string(), "1".to_string())]);
    }
}
