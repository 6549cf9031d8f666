//! Deterministic textual dumps of requests and responses.
//!
//! Headers are written in the order they are stored, which for received
//! messages is the order they arrived. Nothing is normalized, so two dumps of
//! the same message compare equal byte for byte.

use crate::http::{HttpResponse, RawRequest};

/// Status line, headers, blank line and (optionally) the body.
pub fn dump_response(response: &HttpResponse, include_body: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + response.body.len());
    out.extend_from_slice(response.version.as_bytes());
    out.extend_from_slice(format!(" {}", response.status).as_bytes());
    if !response.reason.is_empty() {
        out.push(b' ');
        out.extend_from_slice(response.reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    let headers = response.headers.iter().map(|(n, v)| (n, v.as_bytes()));
    write_headers_and_body(&mut out, headers, &response.body, include_body);
    out
}

/// Request line, headers, blank line and (optionally) the body.
///
/// This is also the exact byte layout the TCP transport writes to the socket.
pub fn dump_request(request: &RawRequest, include_body: bool) -> Vec<u8> {
    dump_request_parts(
        &request.method,
        &request.target,
        &request.version,
        request.headers.iter().map(|(n, v)| (n, v.as_bytes())),
        &request.body,
        include_body,
    )
}

/// `dump_request` for a request whose header values are raw bytes, which
/// are written out unchanged even when they are not UTF-8.
pub fn dump_request_parts<'a>(
    method: &str,
    target: &str,
    version: &str,
    headers: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    body: &[u8],
    include_body: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(128 + body.len());
    out.extend_from_slice(format!("{method} {target} {version}\r\n").as_bytes());
    write_headers_and_body(&mut out, headers, body, include_body);
    out
}

fn write_headers_and_body<'a>(
    out: &mut Vec<u8>,
    headers: impl IntoIterator<Item = (&'a str, &'a [u8])>,
    body: &[u8],
    include_body: bool,
) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    if include_body {
        out.extend_from_slice(body);
    }
}
