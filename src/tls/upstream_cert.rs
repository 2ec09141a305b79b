//! Harvests the CN/SANs of an upstream server's real certificate so a
//! forged leaf can cover the same names, the way `find_cert`/
//! `certutils.get_remote_cert` did in the original mitmproxy: connect,
//! look at what the server actually presents, then mint a matching
//! fake. Skipped entirely when `no_upstream_cert` is set, in which case
//! the forged leaf only covers the requested hostname.

use crate::error::{Error, Result};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

pub struct UpstreamCertFetcher {
    connector: TlsConnector,
}

impl UpstreamCertFetcher {
    pub fn new() -> Self {
        // An accept-all verifier: this connection exists only to read
        // the presented leaf, not to establish a trusted channel.
        let config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth();
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Connect to `host:port`, perform a TLS handshake, and return the
    /// CN and SAN DNS names of the certificate the server presented.
    pub async fn fetch_sans(&self, host: &str, port: u16) -> Result<Vec<String>> {
        let addr = format!("{host}:{port}");
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::UpstreamConnection(format!("{addr}: {e}")))?;
        let server_name = rustls::ServerName::try_from(host)
            .map_err(|_| Error::UpstreamConnection(format!("invalid DNS name: {host}")))?;
        let tls_stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::UpstreamConnection(format!("TLS handshake to {addr}: {e}")))?;
        let (_, session) = tls_stream.get_ref();
        let certs = session
            .peer_certificates()
            .ok_or_else(|| Error::UpstreamConnection(format!("no certificate from {addr}")))?;
        let leaf = certs
            .first()
            .ok_or_else(|| Error::UpstreamConnection(format!("empty chain from {addr}")))?;

        let (_, parsed) = x509_parser::parse_x509_certificate(&leaf.0)
            .map_err(|e| Error::UpstreamConnection(format!("unparseable certificate: {e}")))?;

        let mut names = Vec::new();
        if let Some(cn) = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|a| a.as_str().ok())
        {
            names.push(cn.to_string());
        }
        if let Ok(Some(san)) = parsed.subject_alternative_name() {
            for name in san.value.general_names.iter() {
                if let x509_parser::extensions::GeneralName::DNSName(dns) = name {
                    names.push(dns.to_string());
                }
            }
        }
        names.sort();
        names.dedup();
        debug!(host, port, names = ?names, "harvested upstream certificate SANs");
        Ok(names)
    }

    /// Best-effort variant used on the hot path: logs and returns an
    /// empty list instead of failing the whole intercepted connection
    /// when the upstream can't be reached for harvesting.
    pub async fn fetch_sans_lenient(&self, host: &str, port: u16) -> Vec<String> {
        match self.fetch_sans(host, port).await {
            Ok(names) => names,
            Err(e) => {
                warn!(host, port, error = %e, "failed to harvest upstream certificate, minting with hostname only");
                Vec::new()
            }
        }
    }
}

impl Default for UpstreamCertFetcher {
    fn default() -> Self {
        Self::new()
    }
}

struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}
