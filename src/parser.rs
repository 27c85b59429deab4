//! Incremental HTTP/1.x request parser.
//!
//! [`parse`] is called with everything read from the connection so far. It
//! returns [`ParseError::Incomplete`] until the head and the full
//! `Content-Length` body are buffered.

use std::str::FromStr;

use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use hyper::http::Extensions;
use hyper::HeaderMap;

use crate::error::ParseError;
use crate::http::{Bytes, ConnectionInfo, Method, Request};

/// Upper bound on header lines per request.
pub const MAX_HEADERS: usize = 64;

/// Parses a complete request out of `buf`.
pub fn parse(buf: &[u8]) -> Result<Request, ParseError> {
    parse_prefix(buf).map(|(request, _)| request)
}

/// Parses the request at the start of `buf`, returning it together with the
/// number of bytes it occupies. Anything after those bytes is left alone.
///
/// One empty line before the request line is skipped.
pub fn parse_prefix(buf: &[u8]) -> Result<(Request, usize), ParseError> {
    let skipped = if buf.starts_with(b"\r\n") { 2 } else { 0 };
    let buf = &buf[skipped..];

    let head_end = match find_head_end(buf) {
        Some(end) => end,
        None => {
            // A request line that is already visibly broken needs no more bytes.
            if let Some(line_end) = find_crlf(buf, 0) {
                parse_request_line(&buf[..line_end])?;
            }
            return Err(ParseError::Incomplete);
        }
    };

    let line_end = find_crlf(buf, 0).ok_or(ParseError::InvalidRequestLine)?;
    let (method_token, target) = parse_request_line(&buf[..line_end])?;
    let headers = parse_headers(&buf[line_end + 2..head_end - 2])?;

    if headers.contains_key(TRANSFER_ENCODING) {
        return Err(ParseError::InvalidHeader);
    }
    let content_length = content_length(&headers)?;

    let body_start = head_end;
    let available = buf.len() - body_start;
    if available < content_length {
        return Err(ParseError::Incomplete);
    }

    let (path, query) = match target.find('?') {
        Some(idx) => (&target[..idx], Some(target[idx + 1..].to_owned())),
        None => (target, None),
    };
    let path = if path.is_empty() { "/" } else { path };

    let request = Request {
        method: Method::from_bytes(method_token.as_bytes()),
        method_token: method_token.to_owned(),
        path: path.to_owned(),
        query,
        headers,
        body: Bytes::copy_from_slice(&buf[body_start..body_start + content_length]),
        connection: ConnectionInfo::default(),
        extensions: Extensions::new(),
    };
    Ok((request, skipped + body_start + content_length))
}

/// Returns the offset just past the blank line that ends the head.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| i + from)
}

fn parse_request_line(line: &[u8]) -> Result<(&str, &str), ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::InvalidRequestLine)?;
    let mut parts = line.split(' ');

    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(m), Some(t), Some(v), None) if !m.is_empty() && !t.is_empty() => (m, t, v),
        _ => return Err(ParseError::InvalidRequestLine),
    };

    if !method.bytes().all(is_token_byte) {
        return Err(ParseError::InvalidMethod);
    }
    let target = origin_form(target).ok_or(ParseError::InvalidTarget)?;
    if version != "HTTP/1.1" && version != "HTTP/1.0" {
        return Err(ParseError::InvalidVersion);
    }

    Ok((method, target))
}

/// Reduces an absolute-form target (`http://host/path?q`) to its path and
/// query. Origin-form targets pass through.
fn origin_form(target: &str) -> Option<&str> {
    if target.starts_with('/') {
        return Some(target);
    }
    let rest = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"))?;
    let authority_end = rest.find(|c: char| c == '/' || c == '?').unwrap_or(rest.len());
    if authority_end == 0 {
        return None;
    }
    Some(&rest[authority_end..])
}

fn parse_headers(mut block: &[u8]) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::new();
    let mut count = 0;

    while !block.is_empty() {
        let (line, rest) = match find_crlf(block, 0) {
            Some(end) => (&block[..end], &block[end + 2..]),
            None => (block, &block[block.len()..]),
        };
        block = rest;

        count += 1;
        if count > MAX_HEADERS {
            return Err(ParseError::InvalidHeader);
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::InvalidHeader)?;
        let name = std::str::from_utf8(&line[..colon]).map_err(|_| ParseError::InvalidHeader)?;
        let value = trim_ows(&line[colon + 1..]);

        let name = HeaderName::from_str(name).map_err(|_| ParseError::InvalidHeader)?;
        let value = HeaderValue::from_bytes(value).map_err(|_| ParseError::InvalidHeader)?;
        headers.append(name, value);
    }

    Ok(headers)
}

fn content_length(headers: &HeaderMap) -> Result<usize, ParseError> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(ParseError::InvalidContentLength)?;
        match length {
            Some(prev) if prev != parsed => return Err(ParseError::InvalidContentLength),
            _ => length = Some(parsed),
        }
    }
    Ok(length.unwrap_or(0))
}

fn trim_ows(mut value: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = value {
        value = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = value {
        value = rest;
    }
    value
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}
