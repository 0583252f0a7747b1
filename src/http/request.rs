//! request assembly and serialization

use crate::http::{Headers, HttpError, Url};

/// What goes in the `user-agent` header unless the caller set one.
pub const USER_AGENT: &str = concat!("riptide/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Options => "OPTIONS",
        }
    }
}

/// One HTTP request, queued on a connection.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub(crate) url: Url,
    pub headers: Headers,
    /// Serialized into a single `cookie:` line.
    pub cookies: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Bound on the assembled response body; unlimited when `None`.
    pub max_response_len: Option<usize>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Request {
        Request {
            method,
            url,
            headers: Headers::new(),
            cookies: Vec::new(),
            body: Vec::new(),
            max_response_len: None,
        }
    }

    pub fn get(url: &str) -> Result<Request, HttpError> {
        Ok(Request::new(Method::Get, Url::parse(url)?))
    }

    pub fn post(url: &str, body: Vec<u8>) -> Result<Request, HttpError> {
        let mut request = Request::new(Method::Post, Url::parse(url)?);
        request.body = body;
        Ok(request)
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Request line plus header block, CRLF framed, ending in the empty
    /// line. Auto headers are added only when the caller has not set
    /// them; newlines in values are escaped to keep one header per
    /// line.
    pub(crate) fn serialize_head(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(self.method.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(self.url.path.as_bytes());
        out.extend_from_slice(b" HTTP/1.1\r\n");

        for (name, value) in self.headers.iter() {
            write_header(&mut out, name, value);
        }
        if !self.headers.contains("content-length") {
            write_header(&mut out, "content-length", &self.body.len().to_string());
        }
        if !self.headers.contains("accept") {
            write_header(&mut out, "accept", "*/*");
        }
        if !self.headers.contains("user-agent") {
            write_header(&mut out, "user-agent", USER_AGENT);
        }
        if !self.headers.contains("host") {
            write_header(&mut out, "host", &self.url.host_header());
        }
        if !self.cookies.is_empty() {
            let line = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; ");
            write_header(&mut out, "cookie", &line);
        }

        out.extend_from_slice(b"\r\n");
        out
    }
}

fn write_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.replace('\n', "\\n").as_bytes());
    out.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(head: &[u8]) -> Vec<String> {
        std::str::from_utf8(head)
            .unwrap()
            .split("\r\n")
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn get_serializes_with_auto_headers() {
        let request = Request::get("http://example.com/index.html").unwrap();
        let head = request.serialize_head();
        let lines = lines(&head);

        assert_eq!(lines[0], "GET /index.html HTTP/1.1");
        assert!(lines.contains(&"content-length: 0".to_string()));
        assert!(lines.contains(&"accept: */*".to_string()));
        assert!(lines.contains(&format!("user-agent: {}", USER_AGENT)));
        assert!(lines.contains(&"host: example.com".to_string()));
        // terminated by the empty line
        assert!(head.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn caller_headers_suppress_auto_headers() {
        let mut request = Request::get("http://example.com/").unwrap();
        request.headers.set("User-Agent", "custom/1.0");
        request.headers.set("Host", "override.test");
        let head = String::from_utf8(request.serialize_head()).unwrap();

        assert!(head.contains("user-agent: custom/1.0\r\n"));
        assert!(!head.contains(USER_AGENT));
        assert!(head.contains("host: override.test\r\n"));
        assert_eq!(head.matches("host:").count(), 1);
    }

    #[test]
    fn body_length_is_auto_injected() {
        let request = Request::post("http://example.com/submit", b"hello".to_vec()).unwrap();
        let head = String::from_utf8(request.serialize_head()).unwrap();
        assert!(head.contains("content-length: 5\r\n"));
    }

    #[test]
    fn header_injection_is_escaped() {
        let mut request = Request::get("http://example.com/").unwrap();
        request
            .headers
            .set("x-data", "evil\r\nx-injected: yes".replace('\r', ""));
        let head = String::from_utf8(request.serialize_head()).unwrap();
        assert!(head.contains("x-data: evil\\nx-injected: yes\r\n"));
        assert!(!head.contains("\nx-injected:"));
    }

    #[test]
    fn cookies_collapse_into_one_line() {
        let mut request = Request::get("http://example.com/").unwrap();
        request.cookies.push(("a".into(), "1".into()));
        request.cookies.push(("b".into(), "2".into()));
        let head = String::from_utf8(request.serialize_head()).unwrap();
        assert!(head.contains("cookie: a=1; b=2\r\n"));
        assert_eq!(head.matches("cookie:").count(), 1);
    }

    #[test]
    fn nondefault_port_appears_in_host_header() {
        let request = Request::get("http://example.com:8080/").unwrap();
        let head = String::from_utf8(request.serialize_head()).unwrap();
        assert!(head.contains("host: example.com:8080\r\n"));
    }
}
