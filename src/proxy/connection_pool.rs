//! One handler's cache of its single most recent upstream connection,
//! grounded directly in mitmproxy's `ServerConnectionPool`/
//! `ServerConnection`: not a real pool, just enough reuse to avoid
//! reconnecting on every request of a kept-alive client connection that
//! keeps talking to the same origin.

use crate::error::{Error, Result};
use crate::tls::ca::load_cert_override;
use crate::utils::url::idna_host;
use hyper::client::conn::{Builder, SendRequest};
use hyper::Body;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{rustls, TlsConnector};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Destination {
    host: String,
    port: u16,
    tls: bool,
}

pub struct ServerConnection {
    dest: Destination,
    pub sender: SendRequest<Body>,
}

/// Holds at most one live upstream connection. Asking for a
/// `(host, port)` that doesn't match the cached connection terminates
/// it (mirroring the original's "evict on mismatch, never grow")
/// before dialing a fresh one.
pub struct ServerConnectionPool {
    current: Option<ServerConnection>,
    /// Default client config (no client certificate), used whenever
    /// `tls.client_certs_dir` is unset or has nothing for the
    /// destination host. Built once at construction to avoid reloading
    /// the system root store on every dial.
    client_config: Arc<rustls::ClientConfig>,
    tls: Arc<crate::config::settings::TlsConfig>,
    connect_timeout: Duration,
}

impl ServerConnectionPool {
    pub fn new(
        client_config: Arc<rustls::ClientConfig>,
        tls: Arc<crate::config::settings::TlsConfig>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            current: None,
            client_config,
            tls,
            connect_timeout,
        }
    }

    /// Get a sender for `host:port`, reusing the cached connection if
    /// it is still for the same destination and hasn't closed, or
    /// dialing (and TLS-wrapping, if `tls`) a new one otherwise.
    pub async fn get(
        &mut self,
        host: &str,
        port: u16,
        tls: bool,
    ) -> Result<&mut SendRequest<Body>> {
        let dest = Destination {
            host: host.to_string(),
            port,
            tls,
        };

        let stale = match &self.current {
            Some(conn) => conn.dest != dest || conn.sender.is_closed(),
            None => true,
        };

        if stale {
            if self.current.is_some() {
                debug!(host, port, "evicting cached upstream connection");
            }
            self.current = Some(self.dial(dest).await?);
        }

        Ok(&mut self.current.as_mut().unwrap().sender)
    }

    /// Pick the client config to present when dialing `host`: the
    /// operator's per-host client certificate (`--client-certs`) if one
    /// exists at `{client_certs_dir}/{idna-host}.pem`, else the shared
    /// default config with no client identity.
    fn client_config_for(&self, host: &str) -> Result<Arc<rustls::ClientConfig>> {
        let Some(dir) = &self.tls.client_certs_dir else {
            return Ok(Arc::clone(&self.client_config));
        };
        let path: PathBuf = dir.join(format!("{}.pem", idna_host(host)));
        if !path.is_file() {
            return Ok(Arc::clone(&self.client_config));
        }
        let identity = load_cert_override(&path)
            .map_err(|e| Error::UpstreamConnection(format!("client cert {}: {e}", path.display())))?;
        crate::tls::rustls_config::client_config_with_identity(&self.tls, Some(identity)).map_err(|e| {
            warn!(host, path = %path.display(), error = %e, "failed to build client-cert config");
            e
        })
    }

    async fn dial(&self, dest: Destination) -> Result<ServerConnection> {
        let addr = format!("{}:{}", dest.host, dest.port);
        let tcp = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::UpstreamConnection(format!("{addr}: connect timed out")))?
            .map_err(|e| Error::UpstreamConnection(format!("{addr}: {e}")))?;
        let _ = tcp.set_nodelay(true);

        let sender = if dest.tls {
            let config = self.client_config_for(&dest.host)?;
            let connector = TlsConnector::from(config);
            let server_name = rustls::ServerName::try_from(dest.host.as_str())
                .map_err(|_| Error::UpstreamConnection(format!("invalid DNS name: {}", dest.host)))?;
            let tls_stream = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::UpstreamConnection(format!("TLS to {addr}: {e}")))?;
            let (sender, conn) = Builder::new().handshake(tls_stream).await?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "upstream connection closed");
                }
            });
            sender
        } else {
            let (sender, conn) = Builder::new().handshake(tcp).await?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "upstream connection closed");
                }
            });
            sender
        };

        debug!(host = %dest.host, port = dest.port, tls = dest.tls, "dialed new upstream connection");
        Ok(ServerConnection { dest, sender })
    }

    /// Drop the cached connection, swallowing any shutdown error the
    /// way the original `ServerConnection.terminate` did: the
    /// connection is being discarded either way.
    pub fn evict(&mut self) {
        self.current = None;
    }
}
