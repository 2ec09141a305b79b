//! Builds rustls `ServerConfig`/`ClientConfig` instances: one
//! `ServerConfig` per intercepted connection (keyed by the leaf minted
//! for that SNI) and one shared `ClientConfig` for connections this
//! proxy makes to upstream origins.

use crate::config::settings::TlsConfig;
use crate::error::{Error, Result};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig};
use std::sync::Arc;
use tracing::warn;

/// Build a `ServerConfig` for terminating a single intercepted
/// connection with an already-minted leaf. Intercepted traffic is
/// served as HTTP/1.1 only, so ALPN negotiation isn't offered — letting
/// a client negotiate h2 here would commit this crate to h2 framing it
/// doesn't implement.
pub fn server_config(chain: Vec<Certificate>, key: PrivateKey) -> Result<Arc<ServerConfig>> {
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| Error::Certificate(format!("failed to build server config: {e}")))?;
    Ok(Arc::new(config))
}

/// Build the shared client config used for every upstream connection
/// this proxy makes.
pub fn client_config(tls: &TlsConfig) -> Result<Arc<ClientConfig>> {
    client_config_with_identity(tls, None)
}

/// Build a client config presenting `identity` (a client certificate
/// chain + private key) during the handshake, for dialing an upstream
/// that requires mTLS (`--client-certs`). `identity` is `None` for the
/// common case of no client certificate.
pub fn client_config_with_identity(
    tls: &TlsConfig,
    identity: Option<(Vec<Certificate>, PrivateKey)>,
) -> Result<Arc<ClientConfig>> {
    if tls.skip_upstream_cert_verify {
        warn!("upstream certificate verification disabled");
        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(Arc::new(AcceptAllCertVerifier));
        let config = match identity {
            Some((chain, key)) => builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| Error::Certificate(format!("invalid client certificate: {e}")))?,
            None => builder.with_no_client_auth(),
        };
        return Ok(Arc::new(config));
    }

    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            for cert in certs {
                let _ = roots.add(&Certificate(cert.0));
            }
        }
        Err(e) => warn!(error = %e, "could not load system root certificates"),
    }

    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots);
    let config = match identity {
        Some((chain, key)) => builder
            .with_client_auth_cert(chain, key)
            .map_err(|e| Error::Certificate(format!("invalid client certificate: {e}")))?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Accepts any certificate. Only reachable via the explicit
/// `skip_upstream_cert_verify` escape hatch, which exists for testing
/// against self-signed upstream fixtures.
struct AcceptAllCertVerifier;

impl ServerCertVerifier for AcceptAllCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
