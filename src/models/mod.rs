//! Core data model shared by every proxy component.
//!
//! These replace the logging-oriented `RequestData`/`ResponseData` the
//! forward-proxy teacher used: headers are kept as an ordered list
//! (HTTP allows repeated header names, and order matters for some
//! servers) rather than a `HashMap`, and connections/requests reference
//! each other through opaque ids instead of owning each other directly,
//! so a `ClientConnect` never needs to know about the `Request`s that
//! will eventually arrive on it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use uuid::Uuid;

/// Opaque identifier for one accepted client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(Uuid);

impl ConnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier for one request/response exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReqId(Uuid);

impl ReqId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ReqId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReqId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered, duplicate-preserving header list. Most HTTP header maps
/// collapse repeated names; this one doesn't, matching what actually
/// goes out on the wire (`Set-Cookie` in particular relies on this).
pub type HeaderList = Vec<(String, String)>;

pub fn header_get<'a>(headers: &'a HeaderList, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

pub fn header_set(headers: &mut HeaderList, name: &str, value: impl Into<String>) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    headers.push((name.to_string(), value.into()));
}

pub fn header_remove(headers: &mut HeaderList, name: &str) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
}

/// Published the moment a client socket is accepted, before any bytes of
/// a request have been read.
#[derive(Debug, Clone)]
pub struct ClientConnect {
    pub id: ConnId,
    pub client_addr: SocketAddr,
    pub timestamp: DateTime<Utc>,
    /// Server Name Indication harvested from the TLS ClientHello, when
    /// the connection is being intercepted.
    pub sni: Option<String>,
}

/// Published when a connection's socket is closed, for any reason.
#[derive(Debug, Clone)]
pub struct ClientDisconnect {
    pub id: ConnId,
    pub timestamp: DateTime<Utc>,
    /// Number of request/response exchanges completed on this
    /// connection before it closed.
    pub request_count: u64,
}

/// One HTTP request as read off the wire (or synthesized by the
/// replay worker), resolved to an absolute target.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: ReqId,
    pub conn_id: ConnId,
    pub method: String,
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub http_version: String,
    pub headers: HeaderList,
    pub body: Bytes,
    pub timestamp: DateTime<Utc>,
    pub client_addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Request {
    pub fn target_authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn url(&self) -> String {
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https => "https",
        };
        let default_port = match self.scheme {
            Scheme::Http => 80,
            Scheme::Https => 443,
        };
        if self.port == default_port {
            format!("{scheme}://{}{}", self.host, self.path)
        } else {
            format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
        }
    }
}

/// One HTTP response, either returned by the upstream or synthesized
/// locally for an error.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: ReqId,
    pub status: u16,
    pub reason: String,
    pub http_version: String,
    pub headers: HeaderList,
    pub body: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl Response {
    pub fn content_length(&self) -> Option<u64> {
        header_get(&self.headers, "content-length").and_then(|v| v.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_helpers_are_case_insensitive_and_preserve_order() {
        let mut headers: HeaderList = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("X-A".to_string(), "1".to_string()),
        ];
        assert_eq!(header_get(&headers, "host"), Some("example.com"));
        header_set(&mut headers, "X-A", "2");
        assert_eq!(headers.len(), 2);
        assert_eq!(header_get(&headers, "x-a"), Some("2"));
        header_remove(&mut headers, "HOST");
        assert_eq!(headers.len(), 1);
    }

    #[test]
    fn request_url_omits_default_port() {
        let req = Request {
            id: ReqId::new(),
            conn_id: ConnId::new(),
            method: "GET".to_string(),
            scheme: Scheme::Https,
            host: "example.com".to_string(),
            port: 443,
            path: "/a".to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers: vec![],
            body: Bytes::new(),
            timestamp: Utc::now(),
            client_addr: "127.0.0.1:1234".parse().unwrap(),
        };
        assert_eq!(req.url(), "https://example.com/a");
    }
}
