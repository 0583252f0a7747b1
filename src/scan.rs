//! streaming token scanner for CRLF-framed protocols
//!
//! The scanner is an incremental tokenizer: bytes received from a
//! non-blocking source are fed in, and [`Scanner::next`] yields either
//! the next token or the signal that the source must be read again.
//! Line mode yields CRLF-delimited tokens with the CRLF stripped; fixed
//! mode ([`Scanner::scan_bytes`]) yields an exact byte count and then
//! returns to line mode. The HTTP client uses line mode for the status
//! line, headers and chunk sizes, and fixed mode for chunk and
//! Content-Length bodies.

use derive_more::{Display, Error};

/// Default bound on a single line token (headers in practice).
pub const DEFAULT_MAX_TOKEN_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum ScanError {
    /// A line exceeded the configured `max_token_size`.
    TokenTooLong,
    /// The source ended inside a token the scanner still expected.
    UnexpectedEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Line,
    Fixed(usize),
}

pub struct Scanner {
    buf: Vec<u8>,
    /// Consumed prefix; compacted away as it grows.
    start: usize,
    max_token_size: usize,
    mode: Mode,
    eof: bool,
}

impl Default for Scanner {
    fn default() -> Scanner {
        Scanner::new()
    }
}

impl Scanner {
    pub fn new() -> Scanner {
        Scanner::with_max_token_size(DEFAULT_MAX_TOKEN_SIZE)
    }

    pub fn with_max_token_size(max_token_size: usize) -> Scanner {
        Scanner {
            buf: Vec::new(),
            start: 0,
            max_token_size,
            mode: Mode::Line,
            eof: false,
        }
    }

    /// Returns the scanner to line mode for the next exchange. Unread
    /// bytes stay buffered.
    pub fn reset(&mut self) {
        self.mode = Mode::Line;
        self.eof = false;
    }

    pub fn feed(&mut self, data: &[u8]) {
        if self.start > 4096 && self.start * 2 > self.buf.len() {
            self.buf.drain(..self.start);
            self.start = 0;
        }
        self.buf.extend_from_slice(data);
    }

    /// Marks the source exhausted; pending tokens drain, then
    /// [`ScanError::UnexpectedEof`] surfaces.
    pub fn set_eof(&mut self) {
        self.eof = true;
    }

    pub fn at_eof(&self) -> bool {
        self.eof
    }

    /// Switches to fixed mode: the next token is exactly `n` bytes.
    pub fn scan_bytes(&mut self, n: usize) {
        self.mode = Mode::Fixed(n);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len() - self.start
    }

    /// Hands over everything still buffered; used when the remainder of
    /// the stream is the token (read-until-close bodies).
    pub fn take_rest(&mut self) -> Vec<u8> {
        let rest = self.buf[self.start..].to_vec();
        self.start = self.buf.len();
        rest
    }

    /// The next token, `Ok(None)` when the source must be read again,
    /// or an error.
    pub fn next(&mut self) -> Result<Option<Vec<u8>>, ScanError> {
        match self.mode {
            Mode::Fixed(n) => {
                if self.buffered() >= n {
                    let token = self.buf[self.start..self.start + n].to_vec();
                    self.start += n;
                    self.mode = Mode::Line;
                    return Ok(Some(token));
                }
                if self.eof {
                    return Err(ScanError::UnexpectedEof);
                }
                Ok(None)
            }
            Mode::Line => {
                let haystack = &self.buf[self.start..];
                if let Some(pos) = haystack.iter().position(|&b| b == b'\n') {
                    let mut end = pos;
                    // CRLF framing; a bare LF is tolerated
                    if end > 0 && haystack[end - 1] == b'\r' {
                        end -= 1;
                    }
                    if end > self.max_token_size {
                        return Err(ScanError::TokenTooLong);
                    }
                    let token = haystack[..end].to_vec();
                    self.start += pos + 1;
                    return Ok(Some(token));
                }
                // no newline yet; a token longer than the bound can
                // never materialize, fail as soon as that is certain
                if self.buffered() > self.max_token_size + 1 {
                    return Err(ScanError::TokenTooLong);
                }
                if self.eof {
                    if self.buffered() > 0 {
                        return Ok(Some(self.take_rest()));
                    }
                    return Err(ScanError::UnexpectedEof);
                }
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yields_lines_across_split_feeds() {
        let mut scanner = Scanner::new();
        scanner.feed(b"hel");
        assert_eq!(scanner.next().unwrap(), None);
        scanner.feed(b"lo\r\nwor");
        assert_eq!(scanner.next().unwrap(), Some(b"hello".to_vec()));
        assert_eq!(scanner.next().unwrap(), None);
        scanner.feed(b"ld\r\n");
        assert_eq!(scanner.next().unwrap(), Some(b"world".to_vec()));
    }

    #[test]
    fn strips_crlf_and_tolerates_bare_lf() {
        let mut scanner = Scanner::new();
        scanner.feed(b"a\r\nb\nc\r\n");
        assert_eq!(scanner.next().unwrap(), Some(b"a".to_vec()));
        assert_eq!(scanner.next().unwrap(), Some(b"b".to_vec()));
        assert_eq!(scanner.next().unwrap(), Some(b"c".to_vec()));
    }

    #[test]
    fn token_of_exactly_the_bound_is_accepted() {
        let mut scanner = Scanner::with_max_token_size(8);
        scanner.feed(b"12345678\r\n");
        assert_eq!(scanner.next().unwrap(), Some(b"12345678".to_vec()));
    }

    #[test]
    fn one_byte_past_the_bound_fails() {
        let mut scanner = Scanner::with_max_token_size(8);
        scanner.feed(b"123456789\r\n");
        assert_eq!(scanner.next(), Err(ScanError::TokenTooLong));
    }

    #[test]
    fn overlong_line_fails_before_the_newline_arrives() {
        let mut scanner = Scanner::with_max_token_size(8);
        scanner.feed(b"0123456789abcdef");
        assert_eq!(scanner.next(), Err(ScanError::TokenTooLong));
    }

    #[test]
    fn fixed_mode_returns_exact_count_then_line_mode() {
        let mut scanner = Scanner::new();
        scanner.feed(b"abc");
        scanner.scan_bytes(5);
        assert_eq!(scanner.next().unwrap(), None);
        scanner.feed(b"defg\r\n");
        assert_eq!(scanner.next().unwrap(), Some(b"abcde".to_vec()));
        assert_eq!(scanner.next().unwrap(), Some(b"fg".to_vec()));
    }

    #[test]
    fn fixed_mode_cut_short_by_eof_fails() {
        let mut scanner = Scanner::new();
        scanner.feed(b"ab");
        scanner.scan_bytes(4);
        scanner.set_eof();
        assert_eq!(scanner.next(), Err(ScanError::UnexpectedEof));
    }

    #[test]
    fn unterminated_tail_is_returned_once_then_eof() {
        let mut scanner = Scanner::new();
        scanner.feed(b"partial");
        scanner.set_eof();
        assert_eq!(scanner.next().unwrap(), Some(b"partial".to_vec()));
        assert_eq!(scanner.next(), Err(ScanError::UnexpectedEof));
    }

    #[test]
    fn take_rest_drains_the_buffer() {
        let mut scanner = Scanner::new();
        scanner.feed(b"leftover bytes");
        assert_eq!(scanner.take_rest(), b"leftover bytes".to_vec());
        assert_eq!(scanner.buffered(), 0);
    }
}
