// hap Source Code File
//
// Copyright 2026 Nonpolynomial Labs LLC. All rights reserved.
//
// Licensed under the BSD 3-Clause license. See LICENSE file in the project root
// for full license information.

//! HTTP-like framing for the IP transport: incremental request parsing
//! and response/event building. Only the small dialect HAP uses is
//! understood; anything else is `InvalidData` and costs the stream its
//! connection.

use bytes::{BufMut, BytesMut};

use crate::{Error, Result};

/// Upper bound on the request line plus headers.
const MAX_HEADER_BYTES: usize = 2048;

/// Upper bound on a request body.
const MAX_BODY_BYTES: usize = 64 * 1024;

pub const CONTENT_TYPE_JSON: &str = "application/hap+json";
pub const CONTENT_TYPE_TLV8: &str = "application/pairing+tlv8";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Put,
    Post,
}

#[derive(Debug)]
pub struct HttpRequest {
    pub method: HttpMethod,
    /// Path without the query string.
    pub path: String,
    pub query: Option<String>,
    pub body: Vec<u8>,
}

/// Parses one framed request from the front of `buf`. Returns the request
/// and the bytes consumed, or `None` when more bytes are needed.
pub fn parse_request(buf: &[u8]) -> Result<Option<(HttpRequest, usize)>> {
    let header_end = match find_header_end(buf) {
        Some(end) => end,
        None => {
            if buf.len() > MAX_HEADER_BYTES {
                return Err(Error::InvalidData);
            }
            return Ok(None);
        }
    };
    if header_end > MAX_HEADER_BYTES {
        return Err(Error::InvalidData);
    }

    let header = std::str::from_utf8(&buf[..header_end]).map_err(|_| Error::InvalidData)?;
    let mut lines = header.split("\r\n");
    let request_line = lines.next().ok_or(Error::InvalidData)?;
    let mut parts = request_line.split(' ');
    let method = match parts.next().ok_or(Error::InvalidData)? {
        "GET" => HttpMethod::Get,
        "PUT" => HttpMethod::Put,
        "POST" => HttpMethod::Post,
        _ => return Err(Error::InvalidData),
    };
    let uri = parts.next().ok_or(Error::InvalidData)?;
    match parts.next() {
        Some(version) if version.starts_with("HTTP/1.") => {}
        _ => return Err(Error::InvalidData),
    }

    let mut content_length = 0usize;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(Error::InvalidData)?;
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .trim()
                .parse::<usize>()
                .map_err(|_| Error::InvalidData)?;
            if content_length > MAX_BODY_BYTES {
                return Err(Error::InvalidData);
            }
        }
    }

    let total = header_end + 4 + content_length;
    if buf.len() < total {
        return Ok(None);
    }

    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (uri.to_string(), None),
    };
    Ok(Some((
        HttpRequest {
            method,
            path,
            query,
            body: buf[header_end + 4..total].to_vec(),
        },
        total,
    )))
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Builds a response with an optional body.
pub fn response(status: u16, reason: &str, content_type: Option<&str>, body: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(128 + body.len());
    out.put_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
    if let Some(content_type) = content_type {
        out.put_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
    }
    if !body.is_empty() || content_type.is_some() {
        out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    out.put_slice(b"\r\n");
    out.put_slice(body);
    out.to_vec()
}

pub fn response_no_content() -> Vec<u8> {
    response(204, "No Content", None, &[])
}

/// Builds an EVENT/1.0 frame carrying a JSON body shaped like the
/// characteristics read response.
pub fn event_message(body: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(96 + body.len());
    out.put_slice(b"EVENT/1.0 200 OK\r\n");
    out.put_slice(format!("Content-Type: {}\r\n", CONTENT_TYPE_JSON).as_bytes());
    out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    out.put_slice(b"\r\n");
    out.put_slice(body);
    out.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_get_without_body() {
        let raw = b"GET /accessories HTTP/1.1\r\nHost: lights.local\r\n\r\n";
        let (request, consumed) = parse_request(raw).unwrap().unwrap();
        assert_eq!(consumed, raw.len());
        assert_eq!(request.method, HttpMethod::Get);
        assert_eq!(request.path, "/accessories");
        assert_eq!(request.query, None);
        assert!(request.body.is_empty());
    }

    #[test]
    fn parses_query_and_body() {
        let raw =
            b"PUT /characteristics?id=1.33 HTTP/1.1\r\nContent-Length: 4\r\n\r\nbody extra";
        let (request, consumed) = parse_request(raw).unwrap().unwrap();
        assert_eq!(request.method, HttpMethod::Put);
        assert_eq!(request.path, "/characteristics");
        assert_eq!(request.query.as_deref(), Some("id=1.33"));
        assert_eq!(request.body, b"body");
        // Trailing bytes belong to the next request.
        assert_eq!(consumed, raw.len() - " extra".len());
    }

    #[test]
    fn incomplete_requests_wait() {
        assert_eq!(parse_request(b"GET /accessories HT").unwrap().map(|_| ()), None);
        let partial_body = b"POST /pair-setup HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc";
        assert_eq!(parse_request(partial_body).unwrap().map(|_| ()), None);
    }

    #[test]
    fn malformed_requests_fail() {
        assert!(parse_request(b"BREW /coffee HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_request(b"GET /x SPDY/3\r\n\r\n").is_err());
        assert!(parse_request(b"GET /x HTTP/1.1\r\nContent-Length: nope\r\n\r\n").is_err());
        let huge = format!(
            "GET /x HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_BODY_BYTES + 1
        );
        assert!(parse_request(huge.as_bytes()).is_err());
    }

    #[test]
    fn response_shape() {
        let out = response(200, "OK", Some(CONTENT_TYPE_JSON), b"{}");
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/hap+json\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\n{}"));

        let empty = response_no_content();
        assert_eq!(
            String::from_utf8(empty).unwrap(),
            "HTTP/1.1 204 No Content\r\n\r\n"
        );
    }

    #[test]
    fn event_frame_shape() {
        let out = event_message(b"{\"characteristics\":[]}");
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("EVENT/1.0 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"characteristics\":[]}"));
    }
}
