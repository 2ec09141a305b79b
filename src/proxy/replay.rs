//! Re-issues a previously captured request out of band, grounded in
//! the original's `RequestReplayThread`: a one-shot connection with no
//! pooling, since a replay is a deliberate one-off and shouldn't evict
//! whatever the handler's own `ServerConnectionPool` is caching for its
//! live client.

use crate::error::{Error, Result};
use crate::models::{header_get, HeaderList, Request, Response};
use bytes::Bytes;
use chrono::Utc;
use hyper::client::conn::Builder;
use hyper::{Body, Method, Uri};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::{rustls, TlsConnector};
use tracing::info;

pub struct ReplayWorker {
    client_config: Arc<rustls::ClientConfig>,
}

impl ReplayWorker {
    pub fn new(client_config: Arc<rustls::ClientConfig>) -> Self {
        Self { client_config }
    }

    /// Replay `request` against its original target and return the
    /// response. Always dials fresh; never touches the handler's
    /// connection pool.
    pub async fn replay(&self, request: &Request) -> Result<Response> {
        info!(host = %request.host, port = request.port, path = %request.path, "replaying request");
        let addr = format!("{}:{}", request.host, request.port);
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::UpstreamConnection(format!("{addr}: {e}")))?;

        let is_tls = request.scheme == crate::models::Scheme::Https;
        let mut sender = if is_tls {
            let connector = TlsConnector::from(Arc::clone(&self.client_config));
            let server_name = rustls::ServerName::try_from(request.host.as_str())
                .map_err(|_| Error::UpstreamConnection(format!("invalid DNS name: {}", request.host)))?;
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::UpstreamConnection(format!("TLS to {addr}: {e}")))?;
            let (sender, conn) = Builder::new().handshake(tls_stream).await?;
            tokio::spawn(conn);
            sender
        } else {
            let (sender, conn) = Builder::new().handshake(tcp).await?;
            tokio::spawn(conn);
            sender
        };

        let uri: Uri = request
            .path
            .parse()
            .map_err(|e| Error::RequestProcessing(format!("invalid replay path: {e}")))?;
        let mut builder = hyper::Request::builder()
            .method(Method::from_bytes(request.method.as_bytes()).map_err(|e| {
                Error::RequestProcessing(format!("invalid method for replay: {e}"))
            })?)
            .uri(uri);
        for (name, value) in &request.headers {
            if crate::utils::http::should_forward_request_header(name) {
                builder = builder.header(name, value);
            }
        }
        if let Some(host) = header_get(&request.headers, "host") {
            builder = builder.header("host", host);
        } else {
            builder = builder.header("host", &request.host);
        }
        let hyper_request = builder
            .body(Body::from(request.body.clone()))
            .map_err(|e| Error::RequestProcessing(e.to_string()))?;

        let hyper_response = sender
            .send_request(hyper_request)
            .await
            .map_err(Error::Http)?;

        let status = hyper_response.status().as_u16();
        let reason = hyper_response
            .status()
            .canonical_reason()
            .unwrap_or("")
            .to_string();
        let http_version = format!("{:?}", hyper_response.version());
        let headers: HeaderList = hyper_response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let body = hyper::body::to_bytes(hyper_response.into_body())
            .await
            .map_err(Error::Http)?;

        Ok(Response {
            request_id: request.id,
            status,
            reason,
            http_version,
            headers,
            body: Bytes::from(body),
            timestamp: Utc::now(),
        })
    }
}
