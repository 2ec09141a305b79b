//! TLS interception: certificate authority, leaf minting/caching, and
//! the stream type that lets the handler treat plain and terminated-TLS
//! connections the same way.

pub mod ca;
pub mod cert_store;
pub mod rustls_config;
pub mod stream;
pub mod upstream_cert;

pub use ca::{load_cert_override, CertificateAuthority};
pub use cert_store::CertStore;
pub use stream::MaybeTlsStream;
pub use upstream_cert::UpstreamCertFetcher;
