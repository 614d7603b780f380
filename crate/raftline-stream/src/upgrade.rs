//! The HTTP upgrade handshake that opens a raft stream.
//!
//! After the TLS handshake the dialing side writes a single request
//! head:
//!
//! ```text
//! GET <core-prefix>/raft HTTP/1.1\r\n
//! Host: <address>\r\n
//! Upgrade: raft-0\r\n
//! \r\n
//! ```
//!
//! and starts using the connection as a raw byte stream. The accepting
//! side sends nothing back on success; it only answers with an HTTP
//! error response when it rejects the request.

use hyper::header::{HeaderName, HeaderValue};
use hyper::{Method, Request, StatusCode, Uri, Version};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt as _, AsyncReadExt as _};

/// Value of the `Upgrade` header that selects the raft stream protocol.
pub const UPGRADE_TOKEN: &str = "raft-0";

/// Path of the raft endpoint, under the core prefix.
pub const RAFT_PATH: &str = "/raft";

/// Limit on the size of a request head, request line included.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Full path of the raft endpoint for the given core prefix.
pub fn raft_path(core_prefix: &str) -> String {
    format!("{}{RAFT_PATH}", core_prefix.trim_end_matches('/'))
}

/// The request head a dialer sends to open a raft stream to `address`.
pub fn upgrade_request(core_prefix: &str, address: &str) -> String {
    format!(
        "GET {} HTTP/1.1\r\nHost: {address}\r\nUpgrade: {UPGRADE_TOKEN}\r\n\r\n",
        raft_path(core_prefix)
    )
}

/// Check whether the request asks for the raft stream protocol.
pub fn is_upgrade_request<B>(request: &Request<B>) -> bool {
    request
        .headers()
        .get(hyper::header::UPGRADE)
        .map(|v| v.as_bytes() == UPGRADE_TOKEN.as_bytes())
        .unwrap_or(false)
}

/// Read a request head, up to and including the empty line that ends
/// it.
///
/// Nothing past the end of the head is consumed from `reader`, though
/// `reader` itself may have buffered more.
pub(crate) async fn read_request_head<R>(reader: &mut R) -> io::Result<Request<()>>
where
    R: AsyncBufRead + Unpin,
{
    let mut remaining = MAX_HEAD_LEN;
    let mut lines = Vec::new();
    loop {
        let mut line = String::new();
        let len = (&mut *reader)
            .take(remaining as u64)
            .read_line(&mut line)
            .await?;
        if len == 0 {
            if remaining == 0 {
                return Err(invalid_data("request head too large"));
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before end of request head",
            ));
        }
        remaining -= len;
        if !line.ends_with('\n') {
            return Err(invalid_data("request head too large"));
        }

        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if lines.is_empty() {
                // Tolerate empty lines before the request line.
                continue;
            }
            break;
        }
        lines.push(line.to_string());
    }

    parse_request_head(&lines)
}

/// Parse the lines of a request head, without line terminators.
fn parse_request_head(lines: &[String]) -> io::Result<Request<()>> {
    let (request_line, header_lines) = lines
        .split_first()
        .ok_or_else(|| invalid_data("empty request head"))?;

    let mut parts = request_line.split(' ').filter(|s| !s.is_empty());
    let (method, target, version) = match (parts.next(), parts.next(), parts.next(), parts.next())
    {
        (Some(method), Some(target), Some(version), None) => (method, target, version),
        _ => return Err(invalid_data(format!("malformed request line: {request_line}"))),
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| invalid_data(format!("invalid method: {method}")))?;
    let uri = target
        .parse::<Uri>()
        .map_err(|_| invalid_data(format!("invalid request target: {target}")))?;
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        _ => return Err(invalid_data(format!("unsupported version: {version}"))),
    };

    let mut request = Request::new(());
    *request.method_mut() = method;
    *request.uri_mut() = uri;
    *request.version_mut() = version;
    for line in header_lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| invalid_data(format!("malformed header: {line}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| invalid_data(format!("invalid header name: {name}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| invalid_data(format!("invalid value for header {name}")))?;
        request.headers_mut().append(name, value);
    }

    Ok(request)
}

/// A complete plain-text HTTP error response; the connection is to be
/// closed after it's sent.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Vec<u8> {
    let body = format!("{message}\n");
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         X-Content-Type-Options: nosniff\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        body.len(),
    )
    .into_bytes()
}

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}
