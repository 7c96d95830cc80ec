//! Request-target and header-section parsing.

use std::str::FromStr;

use http::{HeaderMap, HeaderName, HeaderValue};
use n0_error::{AnyError, Result, StackResultExt, StdResultExt, anyerr, ensure_any};
use tokio::io::AsyncRead;

use crate::sniff::Prefixed;

/// Host and port parsed from a request target or upstream address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    /// Hostname or IP literal, without brackets.
    pub host: String,
    /// Port number in host byte order.
    pub port: u16,
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host`, `host:port`, or `[v6addr]:port`, falling back to
    /// `default_port` when no port is given.
    ///
    /// More than one colon outside brackets is rejected as ambiguous with
    /// an unbracketed IPv6 literal.
    pub fn parse(s: &str, default_port: u16) -> Result<Self> {
        let s = s.trim();
        ensure_any!(!s.is_empty(), "empty host");

        if let Some(rest) = s.strip_prefix('[') {
            let end = rest
                .find(']')
                .ok_or_else(|| anyerr!("unterminated '[' in {s:?}"))?;
            let host = &rest[..end];
            if host.is_empty() {
                return Err(anyerr!("empty host in {s:?}"));
            }
            let tail = &rest[end + 1..];
            let port = match tail.strip_prefix(':') {
                None if tail.is_empty() => default_port,
                None => return Err(anyerr!("unexpected trailing {tail:?} in {s:?}")),
                Some(port) => parse_port(port)?,
            };
            return Ok(Self::new(host, port));
        }

        match s.split_once(':') {
            None => Ok(Self::new(s, default_port)),
            Some((host, port)) if !port.contains(':') => {
                if host.is_empty() {
                    return Err(anyerr!("empty host in {s:?}"));
                }
                Ok(Self::new(host, parse_port(port)?))
            }
            Some(_) => Err(anyerr!(
                "ambiguous {s:?}: bracket IPv6 literals as [addr]:port"
            )),
        }
    }
}

impl FromStr for Authority {
    type Err = AnyError;

    /// Parses a `host:port` string; the port is required.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let authority = Self::parse(s, 0)?;
        if authority.port == 0 {
            return Err(anyerr!("missing port in {s:?}"));
        }
        Ok(authority)
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>().std_context("invalid port")
}

/// Splits an absolute-form request target into the origin authority and the
/// path-and-query to send in the rewritten request line.
///
/// Default ports are 80 for `http` and 443 for `https`.
pub fn split_absolute_form(target: &str) -> Result<(Authority, String)> {
    let (rest, default_port) = if let Some(rest) = strip_scheme(target, "http://") {
        (rest, 80)
    } else if let Some(rest) = strip_scheme(target, "https://") {
        (rest, 443)
    } else {
        return Err(anyerr!("not an absolute-form target: {target:?}"));
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], rest[idx..].to_string()),
        None => (rest, "/".to_string()),
    };
    let authority = Authority::parse(authority, default_port)?;
    Ok((authority, path))
}

/// Whether a request target is absolute-form (`http://…` or `https://…`).
pub fn is_absolute_form(target: &str) -> bool {
    strip_scheme(target, "http://").is_some() || strip_scheme(target, "https://").is_some()
}

fn strip_scheme<'a>(target: &'a str, scheme: &str) -> Option<&'a str> {
    if target.len() >= scheme.len() && target[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(&target[scheme.len()..])
    } else {
        None
    }
}

/// Request line and header section of one HTTP/1.x request.
#[derive(Debug)]
pub struct RequestHead {
    /// Method token as received.
    pub method: String,
    /// Request target as received (authority-form, absolute-form, or path).
    pub target: String,
    /// `HTTP/1.0` or `HTTP/1.1`.
    pub version: String,
    /// Header map as received.
    pub headers: HeaderMap<HeaderValue>,
}

impl RequestHead {
    /// Parses a request head from a buffer; `None` when more bytes are
    /// needed. Returns the byte length of the header section (request line
    /// through the terminating empty line).
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf).std_context("invalid request head")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let head = Self::from_httparse(req)?;
                Ok(Some((header_len, head)))
            }
        }
    }

    /// Buffers from `reader` until a full header section is present, and
    /// parses it without consuming it from the reader.
    pub async fn peek<S: AsyncRead + Unpin>(reader: &mut Prefixed<S>) -> Result<(usize, Self)> {
        loop {
            if let Some(parsed) = Self::parse(reader.peeked())? {
                return Ok(parsed);
            }
            ensure_any!(!reader.is_full(), "header section exceeds the buffer limit");
            let n = reader.read_more(usize::MAX).await?;
            ensure_any!(n > 0, "connection closed mid request head");
        }
    }

    fn from_httparse(req: httparse::Request<'_, '_>) -> Result<Self> {
        let method = req.method.context("missing method")?.to_string();
        let target = req.path.context("missing request target")?.to_string();
        let version = match req.version.context("missing version")? {
            0 => "HTTP/1.0".to_string(),
            _ => "HTTP/1.1".to_string(),
        };
        let headers = HeaderMap::from_iter(req.headers.iter().filter_map(|h| {
            let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
            let value = HeaderValue::from_bytes(h.value).ok()?;
            Some((name, value))
        }));
        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    /// The `Host` header value, if present and valid ASCII.
    pub fn host_header(&self) -> Option<&str> {
        self.headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
    }
}

/// Status line of one HTTP/1.x response.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: String,
}

impl ResponseHead {
    /// Parses a response head from a buffer; `None` when more bytes are
    /// needed. Returns the byte length of the header section.
    pub fn parse(buf: &[u8]) -> Result<Option<(usize, Self)>> {
        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut res = httparse::Response::new(&mut headers);
        match res.parse(buf).std_context("invalid response head")? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(header_len) => {
                let status = res.code.context("missing status code")?;
                let reason = res.reason.unwrap_or_default().to_string();
                Ok(Some((header_len, Self { status, reason })))
            }
        }
    }
}

/// Returns the index just past the first CRLF in `buf`, i.e. the length of
/// the request line including its terminator.
pub(crate) fn line_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n").map(|idx| idx + 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authority_bracketed_v6_with_port() {
        let a = Authority::parse("[::1]:8443", 80).unwrap();
        assert_eq!(a, Authority::new("::1", 8443));
        assert_eq!(a.to_string(), "[::1]:8443");
    }

    #[test]
    fn authority_bare_host_takes_the_default_port() {
        let a = Authority::parse("example.com", 443).unwrap();
        assert_eq!(a, Authority::new("example.com", 443));
    }

    #[test]
    fn authority_bracketed_v6_takes_the_default_port() {
        let a = Authority::parse("[::1]", 8080).unwrap();
        assert_eq!(a, Authority::new("::1", 8080));
    }

    #[test]
    fn authority_host_and_port() {
        let a = Authority::parse("127.0.0.1:1080", 0).unwrap();
        assert_eq!(a, Authority::new("127.0.0.1", 1080));
    }

    #[test]
    fn authority_rejects_junk() {
        assert!(Authority::parse("", 80).is_err());
        assert!(Authority::parse("   ", 80).is_err());
        assert!(Authority::parse("a:b:c", 80).is_err());
        assert!(Authority::parse("host:notaport", 80).is_err());
        assert!(Authority::parse("[::1", 80).is_err());
        assert!(Authority::parse("[::1]:nope", 80).is_err());
        assert!(Authority::parse("[::1]junk", 80).is_err());
        assert!(Authority::parse("host:99999", 80).is_err());
    }

    #[test]
    fn absolute_form_splits_host_port_path() {
        let (authority, path) = split_absolute_form("http://127.0.0.1:19000/foo").unwrap();
        assert_eq!(authority, Authority::new("127.0.0.1", 19000));
        assert_eq!(path, "/foo");
    }

    #[test]
    fn absolute_form_defaults_ports_by_scheme() {
        let (a, path) = split_absolute_form("http://example.com/x?q=1").unwrap();
        assert_eq!(a, Authority::new("example.com", 80));
        assert_eq!(path, "/x?q=1");

        let (a, path) = split_absolute_form("HTTPS://example.com").unwrap();
        assert_eq!(a, Authority::new("example.com", 443));
        assert_eq!(path, "/");
    }

    #[test]
    fn request_head_parses_a_connect_request() {
        let buf = b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n";
        let (len, head) = RequestHead::parse(buf).unwrap().unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.test:443");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.host_header(), Some("example.test:443"));
    }

    #[test]
    fn request_head_is_none_while_incomplete() {
        let buf = b"GET http://example.com/ HTTP/1.1\r\nHost: exa";
        assert!(RequestHead::parse(buf).unwrap().is_none());
    }

    #[test]
    fn request_head_rejects_garbage() {
        assert!(RequestHead::parse(b"\x16\x03\x01\x02\x00\r\n\r\n").is_err());
    }

    #[test]
    fn response_head_carries_status_and_reason() {
        let buf = b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n";
        let (len, head) = ResponseHead::parse(buf).unwrap().unwrap();
        assert_eq!(len, buf.len());
        assert_eq!(head.status, 407);
        assert_eq!(head.reason, "Proxy Authentication Required");
    }

    #[test]
    fn line_end_finds_the_request_line_terminator() {
        assert_eq!(line_end(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"), Some(16));
        assert_eq!(line_end(b"no terminator"), None);
    }
}
