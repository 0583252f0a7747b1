//! HTTP/1.1 client
//!
//! Connections own a FIFO queue of requests processed one at a time:
//! serialize and send the request, scan the response line, headers and
//! body off the socket, invoke the callback, move to the next request.
//! HTTPS runs through the [`tls`](crate::tls) provider seam with the
//! handshake driven by readiness polls.
//!
//! # Module Structure
//!
//! * `headers` - ordered case-insensitive header map and cookies
//! * `request` - request assembly and serialization
//! * `response` - response types, body framing, form decoding
//! * `client` - connection state machine and request queue

use derive_more::{Display, Error, From};

use crate::aio::AioError;
use crate::dns::ResolveError;
use crate::scan::ScanError;

/// Ordered case-insensitive header map and cookies
pub mod headers;

/// Request assembly and serialization
pub mod request;

/// Response parsing and body framing
pub mod response;

/// Connection state machine and request queue
pub mod client;

pub use client::{Connection, HttpClient};
pub use headers::{Cookie, Headers};
pub use request::{Method, Request};
pub use response::{Body, Response};

#[derive(Debug, Clone, PartialEq, Display, Error, From)]
pub enum HttpError {
    InvalidUrl,
    InvalidResponseVersion,
    InvalidResponseStatus,
    InvalidResponseHeader,
    InvalidResponseCookie,
    /// The response carries no framing information where some was
    /// required.
    NoLength,
    InvalidLength,
    /// The body outgrew the caller's limit.
    TooLong,
    InvalidChunkSize,
    InvalidTrailerHeader,
    /// HTTPS was requested on a client built without a TLS provider.
    NoTlsProvider,
    /// The peer began an orderly TLS shutdown mid-exchange.
    ControlledShutdown,
    /// The TLS session failed fatally.
    FatalShutdown,
    /// The TLS layer accepted no bytes while the socket was writable.
    WriteFailed,
    Scan(ScanError),
    Transport(AioError),
    Dns(ResolveError),
}

/// The scheme of a [`Url`]; only HTTP and HTTPS exist here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// A parsed request target: scheme, host, port and path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

impl Url {
    pub fn parse(input: &str) -> Result<Url, HttpError> {
        let (scheme, rest) = input.split_once("://").ok_or(HttpError::InvalidUrl)?;
        let scheme = match scheme.to_ascii_lowercase().as_str() {
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            _ => return Err(HttpError::InvalidUrl),
        };

        let (authority, path) = match rest.find(|c| c == '/' || c == '?') {
            Some(pos) if rest.as_bytes()[pos] == b'/' => (&rest[..pos], rest[pos..].to_string()),
            Some(pos) => (&rest[..pos], format!("/{}", &rest[pos..])),
            None => (rest, "/".to_string()),
        };
        if authority.is_empty() || authority.contains('@') {
            return Err(HttpError::InvalidUrl);
        }

        let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
            // bracketed IPv6 literal
            let (host, after) = rest.split_once(']').ok_or(HttpError::InvalidUrl)?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(port.parse::<u16>().map_err(|_| HttpError::InvalidUrl)?),
                None if after.is_empty() => None,
                None => return Err(HttpError::InvalidUrl),
            };
            (host.to_string(), port)
        } else if let Some((host, port)) = authority.rsplit_once(':') {
            if host.contains(':') {
                return Err(HttpError::InvalidUrl);
            }
            (
                host.to_string(),
                Some(port.parse::<u16>().map_err(|_| HttpError::InvalidUrl)?),
            )
        } else {
            (authority.to_string(), None)
        };
        if host.is_empty() {
            return Err(HttpError::InvalidUrl);
        }

        Ok(Url {
            scheme,
            host: host.to_ascii_lowercase(),
            port: port.unwrap_or_else(|| scheme.default_port()),
            path,
        })
    }

    /// Value for the auto-injected `host` header: the port appears only
    /// when it is not the scheme default.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Decodes percent escapes (and `+` as space) in a form key or value.
pub(crate) fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hi = (hex[0] as char).to_digit(16)?;
                let lo = (hex[1] as char).to_digit(16)?;
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}
