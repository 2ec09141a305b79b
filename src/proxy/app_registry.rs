//! Local application dispatch: lets a handful of `(host, port)` pairs
//! be served directly by an in-process app instead of going out to the
//! network and through the controller, mirroring mitmproxy's
//! `AppRegistry`.

use crate::models::{header_get, Request, Response};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A locally-registered application.
#[async_trait]
pub trait LocalApp: Send + Sync {
    async fn handle(&self, request: &Request) -> Response;
}

#[derive(Default)]
pub struct AppRegistry {
    apps: HashMap<(String, u16), Arc<dyn LocalApp>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, host: impl Into<String>, port: u16, app: Arc<dyn LocalApp>) {
        self.apps.insert((host.into(), port), app);
    }

    /// Two-step lookup, exactly as the original `AppRegistry.get` did:
    /// an exact `(host, port)` match first, falling back to whatever
    /// the request's `Host` header says (a request can arrive with a
    /// `Host` that differs from the connection's resolved destination,
    /// e.g. behind a CDN-style front).
    pub fn get(&self, request: &Request) -> Option<Arc<dyn LocalApp>> {
        if let Some(app) = self.apps.get(&(request.host.clone(), request.port)) {
            return Some(Arc::clone(app));
        }
        let host_header = header_get(&request.headers, "host")?;
        let (host, port) = match host_header.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(request.port)),
            None => (host_header.to_string(), request.port),
        };
        self.apps.get(&(host, port)).map(Arc::clone)
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnId, ReqId, Scheme};
    use bytes::Bytes;
    use chrono::Utc;

    struct Echo;

    #[async_trait]
    impl LocalApp for Echo {
        async fn handle(&self, request: &Request) -> Response {
            Response {
                request_id: request.id,
                status: 200,
                reason: "OK".to_string(),
                http_version: "HTTP/1.1".to_string(),
                headers: vec![],
                body: Bytes::from_static(b"echo"),
                timestamp: Utc::now(),
            }
        }
    }

    fn request(host: &str, port: u16, host_header: Option<&str>) -> Request {
        let mut headers = vec![];
        if let Some(h) = host_header {
            headers.push(("Host".to_string(), h.to_string()));
        }
        Request {
            id: ReqId::new(),
            conn_id: ConnId::new(),
            method: "GET".to_string(),
            scheme: Scheme::Http,
            host: host.to_string(),
            port,
            path: "/".to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers,
            body: Bytes::new(),
            timestamp: Utc::now(),
            client_addr: "127.0.0.1:1".parse().unwrap(),
        }
    }

    #[test]
    fn exact_match_wins_over_host_header() {
        let mut registry = AppRegistry::new();
        registry.add("app.local", 80, Arc::new(Echo));
        let req = request("app.local", 80, Some("other.local"));
        assert!(registry.get(&req).is_some());
    }

    #[test]
    fn falls_back_to_host_header() {
        let mut registry = AppRegistry::new();
        registry.add("app.local", 80, Arc::new(Echo));
        let req = request("1.2.3.4", 80, Some("app.local"));
        assert!(registry.get(&req).is_some());
    }

    #[test]
    fn no_match_returns_none() {
        let registry = AppRegistry::new();
        let req = request("app.local", 80, None);
        assert!(registry.get(&req).is_none());
    }
}
