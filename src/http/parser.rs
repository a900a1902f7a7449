use std::str;

use crate::error::HttpError;
use crate::http::{Headers, Method, StatusCode};

pub const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Offset just past the blank line that ends the head, if it has arrived.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    twoway::find_bytes(buf, HEAD_TERMINATOR).map(|idx| idx + HEAD_TERMINATOR.len())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub target: String,
    pub version: String,
}

/// Splits a complete head (terminator included) into its request line and
/// header fields.
pub fn parse_head(head: &[u8]) -> Result<(RequestLine, Headers), HttpError> {
    let text = str::from_utf8(head).map_err(|_| HttpError::bad_request("invalid utf8 in head"))?;
    let text = text.strip_suffix("\r\n\r\n").unwrap_or(text);
    let (first, rest) = match text.split_once("\r\n") {
        Some(split) => split,
        None => return Err(HttpError::bad_request("no headers")),
    };
    let line = parse_request_line(first)?;
    let headers = parse_header_block(rest)?;
    Ok((line, headers))
}

pub fn parse_request_line(line: &str) -> Result<RequestLine, HttpError> {
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(HttpError::bad_request(format!("invalid request line: {line}")));
    }
    let method = Method::parse(parts[0])?;
    let version = parse_version(parts[2])?;
    Ok(RequestLine { method, target: parts[1].to_string(), version })
}

/// Accepts `HTTP/<d>.<d>`; any major version but 1 is 505.
fn parse_version(raw: &str) -> Result<String, HttpError> {
    let digits = raw
        .strip_prefix("HTTP/")
        .ok_or_else(|| HttpError::bad_request(format!("invalid http version: {raw}")))?;
    let bytes = digits.as_bytes();
    if bytes.len() != 3 || !bytes[0].is_ascii_digit() || bytes[1] != b'.' || !bytes[2].is_ascii_digit() {
        return Err(HttpError::bad_request(format!("invalid http version: {raw}")));
    }
    if bytes[0] != b'1' {
        return Err(HttpError::protocol(
            StatusCode::HttpVersionNotSupported,
            format!("unsupported http version: {raw}"),
        ));
    }
    Ok(raw.to_string())
}

fn parse_header_block(block: &str) -> Result<Headers, HttpError> {
    let mut headers = Headers::new();
    for line in block.split("\r\n") {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HttpError::bad_request(format!("invalid header: {line}")))?;
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            return Err(HttpError::bad_request(format!("invalid header name: {line}")));
        }
        headers.append(name, value.trim());
    }
    Ok(headers)
}
