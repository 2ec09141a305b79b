//! Turns bytes on an accepted connection into a [`Request`], the way
//! the original `read_request_proxy`/`read_request_transparent`/
//! `read_request_reverse` did for the three intake modes: explicit
//! proxy requests carry an absolute URI (or are a `CONNECT`), while
//! transparent and reverse requests carry an origin-form path and rely
//! on the intake mode (or the OS, for transparent) to supply the
//! destination.

use crate::config::settings::IntakeMode;
use crate::error::ProxyError;
use crate::models::HeaderList;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

pub struct ParsedRequest {
    pub method: String,
    pub target: RequestTarget,
    pub http_version: String,
    pub headers: HeaderList,
    pub body: Bytes,
}

pub enum RequestTarget {
    /// `CONNECT host:port` — no further request follows on this stream
    /// until TLS interception (or raw tunneling) is set up.
    Connect { host: String, port: u16 },
    /// An absolute-form URI, as sent by an explicit-mode client.
    Absolute(url::Url),
    /// An origin-form path (`/foo?bar`), as sent once inside a CONNECT
    /// tunnel, or by a transparent/reverse-mode client.
    Origin(String),
}

/// Reads exactly one HTTP request (request line + headers + body) from
/// `reader`, tolerating one leading blank line before the request line
/// the way `get_line` did, since some clients send a stray `\r\n` after
/// a previous response before their next request.
pub async fn read_request<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    body_size_limit: usize,
) -> Result<ParsedRequest, ProxyError> {
    let mut line = read_line_tolerant(reader).await?;
    let mut parts = line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| ProxyError::bad_request("empty request line"))?
        .to_string();
    let target_str = parts
        .next()
        .ok_or_else(|| ProxyError::bad_request("missing request target"))?
        .to_string();
    let http_version = parts
        .next()
        .unwrap_or("HTTP/1.1")
        .to_string();
    line.clear();

    let target = if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = crate::utils::http::parse_connect_target(&target_str)
            .map_err(ProxyError::bad_request)?;
        RequestTarget::Connect { host, port }
    } else if target_str.starts_with("http://") || target_str.starts_with("https://") {
        let url = url::Url::parse(&target_str)
            .map_err(|e| ProxyError::bad_request(format!("invalid request URI: {e}")))?;
        RequestTarget::Absolute(url)
    } else {
        RequestTarget::Origin(target_str)
    };

    let headers = read_headers(reader).await?;

    let body = if matches!(target, RequestTarget::Connect { .. }) {
        Bytes::new()
    } else {
        read_body(reader, &headers, body_size_limit).await?
    };

    Ok(ParsedRequest {
        method,
        target,
        http_version,
        headers,
        body,
    })
}

async fn read_line_tolerant<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<String, ProxyError> {
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .map_err(|e| ProxyError::bad_request(format!("failed to read request line: {e}")))?;
    if line.trim().is_empty() {
        // Tolerate exactly one stray blank line before the real request
        // line, as the original's `get_line` did.
        line.clear();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| ProxyError::bad_request(format!("failed to read request line: {e}")))?;
    }
    if line.trim().is_empty() {
        return Err(ProxyError::bad_request("empty request"));
    }
    Ok(line.trim_end().to_string())
}

async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderList, ProxyError> {
    let mut headers = HeaderList::new();
    loop {
        let mut line = String::new();
        reader
            .read_line(&mut line)
            .await
            .map_err(|e| ProxyError::bad_request(format!("failed to read headers: {e}")))?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| ProxyError::bad_request(format!("malformed header line: {line}")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(headers)
}

async fn read_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    headers: &HeaderList,
    body_size_limit: usize,
) -> Result<Bytes, ProxyError> {
    if let Some(len) = crate::models::header_get(headers, "content-length") {
        let len: usize = len
            .parse()
            .map_err(|_| ProxyError::bad_request("invalid Content-Length"))?;
        if len > body_size_limit {
            return Err(ProxyError::payload_too_large(format!(
                "body of {len} bytes exceeds the {body_size_limit}-byte limit"
            )));
        }
        let mut buf = vec![0u8; len];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|e| ProxyError::bad_request(format!("short body read: {e}")))?;
        return Ok(Bytes::from(buf));
    }
    if crate::models::header_get(headers, "transfer-encoding")
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
    {
        return read_chunked_body(reader, body_size_limit).await;
    }
    Ok(Bytes::new())
}

async fn read_chunked_body<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    body_size_limit: usize,
) -> Result<Bytes, ProxyError> {
    let mut body = Vec::new();
    loop {
        let mut size_line = String::new();
        reader
            .read_line(&mut size_line)
            .await
            .map_err(|e| ProxyError::bad_request(format!("chunked read: {e}")))?;
        let size_str = size_line.trim().split(';').next().unwrap_or("");
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ProxyError::bad_request("invalid chunk size"))?;
        if size == 0 {
            // consume the trailing CRLF (and any trailer headers, which
            // this proxy doesn't need to preserve for its own forwarding
            // since it re-chunks or sets Content-Length itself).
            loop {
                let mut trailer = String::new();
                reader.read_line(&mut trailer).await.ok();
                if trailer.trim().is_empty() {
                    break;
                }
            }
            break;
        }
        if body.len() + size > body_size_limit {
            return Err(ProxyError::payload_too_large(format!(
                "chunked body exceeds the {body_size_limit}-byte limit"
            )));
        }
        let mut chunk = vec![0u8; size];
        reader
            .read_exact(&mut chunk)
            .await
            .map_err(|e| ProxyError::bad_request(format!("short chunk read: {e}")))?;
        body.extend_from_slice(&chunk);
        let mut crlf = [0u8; 2];
        reader
            .read_exact(&mut crlf)
            .await
            .map_err(|e| ProxyError::bad_request(format!("chunk trailer read: {e}")))?;
    }
    Ok(Bytes::from(body))
}

/// Resolve a parsed request plus the connection's own state into a
/// fully addressed [`Request`], applying the intake mode's rule for
/// where the destination comes from.
#[allow(clippy::too_many_arguments)]
pub fn resolve_target(
    parsed_target: &RequestTarget,
    headers: &HeaderList,
    intake_mode: &IntakeMode,
    original_dst: Option<SocketAddr>,
    is_tls: bool,
) -> Result<(String, u16, String), ProxyError> {
    match parsed_target {
        RequestTarget::Absolute(url) => {
            let host = url
                .host_str()
                .ok_or_else(|| ProxyError::bad_request("missing host in absolute URI"))?
                .to_string();
            let port = url.port_or_known_default().unwrap_or(80);
            Ok((host, port, url.path().to_string()))
        }
        RequestTarget::Origin(path) => match intake_mode {
            IntakeMode::Reverse { upstream } => {
                let (host, port) = crate::utils::http::parse_connect_target(upstream)
                    .unwrap_or((upstream.clone(), if is_tls { 443 } else { 80 }));
                Ok((host, port, path.clone()))
            }
            IntakeMode::Transparent => {
                let addr = original_dst
                    .ok_or_else(|| ProxyError::bad_gateway("could not recover original destination"))?;
                Ok((addr.ip().to_string(), addr.port(), path.clone()))
            }
            IntakeMode::Explicit => {
                let host_header = crate::models::header_get(headers, "host")
                    .ok_or_else(|| ProxyError::bad_request("missing Host header"))?;
                let (host, port) = match host_header.rsplit_once(':') {
                    Some((h, p)) => (h.to_string(), p.parse().unwrap_or(if is_tls { 443 } else { 80 })),
                    None => (host_header.to_string(), if is_tls { 443 } else { 80 }),
                };
                Ok((host, port, path.clone()))
            }
        },
        RequestTarget::Connect { host, port } => Ok((host.clone(), *port, "/".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn reads_simple_get_request() {
        let raw = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(Cursor::new(&raw[..]));
        let parsed = read_request(&mut reader, 1024 * 1024).await.unwrap();
        assert_eq!(parsed.method, "GET");
        assert!(matches!(parsed.target, RequestTarget::Origin(ref p) if p == "/"));
        assert_eq!(
            crate::models::header_get(&parsed.headers, "host"),
            Some("example.com")
        );
    }

    #[tokio::test]
    async fn tolerates_one_leading_blank_line() {
        let raw = b"\r\nGET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(Cursor::new(&raw[..]));
        let parsed = read_request(&mut reader, 1024 * 1024).await.unwrap();
        assert_eq!(parsed.method, "GET");
    }

    #[tokio::test]
    async fn reads_connect_target() {
        let raw = b"CONNECT example.com:443 HTTP/1.1\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(Cursor::new(&raw[..]));
        let parsed = read_request(&mut reader, 1024 * 1024).await.unwrap();
        match parsed.target {
            RequestTarget::Connect { host, port } => {
                assert_eq!(host, "example.com");
                assert_eq!(port, 443);
            }
            _ => panic!("expected Connect"),
        }
    }

    #[tokio::test]
    async fn reads_request_with_body() {
        let raw = b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello";
        let mut reader = tokio::io::BufReader::new(Cursor::new(&raw[..]));
        let parsed = read_request(&mut reader, 1024 * 1024).await.unwrap();
        assert_eq!(&parsed.body[..], b"hello");
    }

    #[tokio::test]
    async fn reads_chunked_body() {
        let raw = b"POST /x HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(Cursor::new(&raw[..]));
        let parsed = read_request(&mut reader, 1024 * 1024).await.unwrap();
        assert_eq!(&parsed.body[..], b"hello");
    }

    #[tokio::test]
    async fn oversized_body_is_rejected_with_413() {
        let raw = b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 10\r\n\r\n0123456789";
        let mut reader = tokio::io::BufReader::new(Cursor::new(&raw[..]));
        let err = read_request(&mut reader, 5).await.unwrap_err();
        assert_eq!(err.code, 413);
    }

    #[tokio::test]
    async fn oversized_chunked_body_is_rejected_with_413() {
        let raw = b"POST /x HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n";
        let mut reader = tokio::io::BufReader::new(Cursor::new(&raw[..]));
        let err = read_request(&mut reader, 6).await.unwrap_err();
        assert_eq!(err.code, 413);
    }

    #[test]
    fn resolves_explicit_mode_from_host_header() {
        let headers = vec![("Host".to_string(), "example.com:8080".to_string())];
        let (host, port, path) = resolve_target(
            &RequestTarget::Origin("/a".to_string()),
            &headers,
            &IntakeMode::Explicit,
            None,
            false,
        )
        .unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8080);
        assert_eq!(path, "/a");
    }

    #[test]
    fn resolves_transparent_mode_from_original_destination() {
        let (host, port, _) = resolve_target(
            &RequestTarget::Origin("/a".to_string()),
            &[],
            &IntakeMode::Transparent,
            Some("10.0.0.5:443".parse().unwrap()),
            true,
        )
        .unwrap();
        assert_eq!(host, "10.0.0.5");
        assert_eq!(port, 443);
    }
}
