use core::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use hyper::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::http::Extensions;
use hyper::{HeaderMap, StatusCode};

use crate::error::HandlerError;
use crate::handler::Step;

pub use hyper::body::Bytes;

/// Request methods understood by the router.
///
/// Requests carrying any other method token parse as [`Method::All`], the
/// catch-all. On a route, `All` matches every request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    All,
}

impl Method {
    /// Maps a request-line method token. Unknown tokens become `All`.
    pub fn from_bytes(b: &[u8]) -> Self {
        match b {
            b"GET" => Method::Get,
            b"POST" => Method::Post,
            b"PUT" => Method::Put,
            b"DELETE" => Method::Delete,
            _ => Method::All,
        }
    }

    /// Whether a route registered with `self` accepts a request made with `request`.
    pub fn accepts(self, request: Method) -> bool {
        self == Method::All || self == request
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::All => "ALL",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addresses of the connection a request arrived on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer_addr: Option<SocketAddr>,
    pub local_addr: Option<SocketAddr>,
}

impl ConnectionInfo {
    pub fn new(peer_addr: Option<SocketAddr>, local_addr: Option<SocketAddr>) -> Self {
        Self {
            peer_addr,
            local_addr,
        }
    }
}

/// A parsed HTTP request.
///
/// Produced by [`parser::parse`](crate::parser::parse) and handed to every
/// handler in the chain by mutable reference, so middleware can stash values
/// in [`extensions_mut`](Request::extensions_mut) for later handlers.
#[derive(Debug)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) method_token: String,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Bytes,
    pub(crate) connection: ConnectionInfo,
    pub(crate) extensions: Extensions,
}

impl Request {
    pub fn method(&self) -> Method {
        self.method
    }

    /// The method exactly as it appeared on the request line.
    pub fn method_token(&self) -> &str {
        &self.method_token
    }

    /// The request path without the query string.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The raw query string, without the leading `?`.
    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Returns the first value of the query parameter `name`.
    ///
    /// Values are returned as they appear on the wire; no percent-decoding
    /// is applied.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.as_deref()?.split('&').find_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (key == name).then_some(value)
        })
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Returns a header value if it is present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn connection(&self) -> &ConnectionInfo {
        &self.connection
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

/// An HTTP response accumulated by handlers.
///
/// A response starts as `200 OK` with no body. Handlers adjust it and call
/// [`send`](Response::send), [`text`](Response::text) or
/// [`end`](Response::end) to finalize it, which also stops the chain.
///
/// ```
/// # use trellis::{Response, StatusCode};
/// let mut res = Response::new();
/// res.status(StatusCode::CREATED).set_header("x-id", "42").unwrap();
/// let _step = res.send("made");
/// assert!(res.is_finalized());
/// assert_eq!(res.body_bytes(), b"made");
/// ```
#[derive(Debug, Default)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
    finalized: bool,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a finalized plain-text response.
    pub(crate) fn plain(status: StatusCode, body: &str) -> Self {
        let mut res = Response::new();
        res.status = status;
        res.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        res.body = body.as_bytes().to_vec();
        res.finalized = true;
        res
    }

    pub fn status(&mut self, status: StatusCode) -> &mut Self {
        self.status = status;
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Sets a header, replacing any previous value with the same name.
    ///
    /// # Errors
    /// Returns `HandlerError::InvalidHeader` when the name or value cannot be encoded.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<&mut Self, HandlerError> {
        let name = HeaderName::from_str(name)
            .map_err(|_| HandlerError::InvalidHeader(name.to_owned()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| HandlerError::InvalidHeader(format!("{}: {}", name, value)))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    /// Replaces the body without finalizing.
    pub fn body(&mut self, body: impl Into<Vec<u8>>) -> &mut Self {
        self.body = body.into();
        self
    }

    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Appends to the body without finalizing.
    pub fn write(&mut self, chunk: &[u8]) -> &mut Self {
        self.body.extend_from_slice(chunk);
        self
    }

    /// Sets the body and finalizes the response.
    pub fn send(&mut self, body: impl Into<Vec<u8>>) -> Step {
        self.body(body);
        self.end()
    }

    /// Sets status, a `text/plain` content type and the body, then finalizes.
    pub fn text(&mut self, status: StatusCode, body: impl Into<String>) -> Step {
        self.status = status;
        self.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        self.body = body.into().into_bytes();
        self.end()
    }

    /// Finalizes the response as it stands.
    pub fn end(&mut self) -> Step {
        self.finalized = true;
        Step::halt()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub(crate) fn finalize(&mut self) {
        self.finalized = true;
    }

    /// Serializes the response as an HTTP/1.1 message.
    ///
    /// Headers appear in insertion order, followed by `content-length` and
    /// `connection: close`, which always override handler-set values.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(128 + self.body.len());
        out.extend_from_slice(b"HTTP/1.1 ");
        out.extend_from_slice(self.status.as_str().as_bytes());
        out.push(b' ');
        out.extend_from_slice(
            self.status
                .canonical_reason()
                .unwrap_or("Unknown")
                .as_bytes(),
        );
        out.extend_from_slice(b"\r\n");

        for (name, value) in self.headers.iter() {
            if name == CONTENT_LENGTH || name == CONNECTION {
                continue;
            }
            out.extend_from_slice(name.as_str().as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(format!("content-length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"connection: close\r\n\r\n");
        out.extend_from_slice(&self.body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    #[test]
    fn test_method_from_bytes() {
        assert_eq!(Method::from_bytes(b"GET"), Method::Get);
        assert_eq!(Method::from_bytes(b"DELETE"), Method::Delete);
        assert_eq!(Method::from_bytes(b"PATCH"), Method::All);
        assert_eq!(Method::from_bytes(b"get"), Method::All);
    }

    #[test]
    fn test_method_accepts() {
        assert!(Method::All.accepts(Method::Post));
        assert!(Method::Get.accepts(Method::Get));
        assert!(!Method::Get.accepts(Method::Post));
        assert!(!Method::Get.accepts(Method::All));
    }

    #[test]
    fn test_query_params() {
        let req = parse(b"GET /search?q=rust&page=2&flag HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path(), "/search");
        assert_eq!(req.query(), Some("q=rust&page=2&flag"));
        assert_eq!(req.query_param("page"), Some("2"));
        assert_eq!(req.query_param("flag"), Some(""));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn test_request_extensions() {
        let mut req = parse(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        req.extensions_mut().insert(7u32);
        assert_eq!(req.extensions().get::<u32>(), Some(&7));
    }

    #[test]
    fn test_default_response_serialization() {
        let res = Response::new();
        assert_eq!(
            res.to_bytes(),
            b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n".to_vec()
        );
    }

    #[test]
    fn test_response_serialization_overrides_framing_headers() {
        let mut res = Response::new();
        res.set_header("X-Trace", "abc").unwrap();
        res.set_header("Content-Length", "999").unwrap();
        res.set_header("Connection", "keep-alive").unwrap();
        let _ = res.text(StatusCode::NOT_FOUND, "gone");

        let wire = String::from_utf8(res.to_bytes()).unwrap();
        assert!(wire.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(wire.contains("x-trace: abc\r\n"));
        assert!(wire.contains("content-length: 4\r\n"));
        assert!(!wire.contains("999"));
        assert!(!wire.contains("keep-alive"));
        assert!(wire.ends_with("\r\n\r\ngone"));
    }

    #[test]
    fn test_set_header_rejects_invalid_name() {
        let mut res = Response::new();
        assert!(matches!(
            res.set_header("bad header", "v"),
            Err(HandlerError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_body_and_write_do_not_finalize() {
        let mut res = Response::new();
        res.body("ab").write(b"cd");
        assert_eq!(res.body_bytes(), b"abcd");
        assert!(!res.is_finalized());
    }
}
