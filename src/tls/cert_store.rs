//! Cache of minted leaf certificates.
//!
//! Keyed by `(common name, SAN set, CA fingerprint)` so that changing
//! which CA is signing (e.g. a fresh `--cacert` on restart) can never
//! hand out a leaf signed by a stale authority. Minting is the
//! expensive step (RSA/ECDSA keygen + signing); the cache makes repeat
//! connections to the same host free after the first.

use crate::error::Result;
use crate::tls::ca::{load_cert_override, CertificateAuthority};
use crate::utils::url::idna_host;
use moka::future::Cache;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub type LeafCert = (Vec<rustls::Certificate>, rustls::PrivateKey);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    common_name: String,
    sans: Vec<String>,
    ca_fingerprint: [u8; 32],
}

/// Async, bounded cache of (CN, SAN-set) -> signed leaf certificate.
pub struct CertStore {
    cache: Cache<CacheKey, Arc<LeafCert>>,
    ca: Arc<CertificateAuthority>,
    /// Persistent on-disk cache of minted leaves (`--dummy-certs`), an
    /// alternative to pure in-memory `moka` storage: leaves survive a
    /// process restart instead of being re-minted.
    dummy_certs_dir: Option<PathBuf>,
}

impl CertStore {
    pub fn new(ca: Arc<CertificateAuthority>, capacity: u64) -> Self {
        Self::with_dummy_certs_dir(ca, capacity, None)
    }

    pub fn with_dummy_certs_dir(
        ca: Arc<CertificateAuthority>,
        capacity: u64,
        dummy_certs_dir: Option<PathBuf>,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(Duration::from_secs(6 * 60 * 60))
            .build();
        Self {
            cache,
            ca,
            dummy_certs_dir,
        }
    }

    /// Return a cached leaf for `(common_name, sans)`, minting and
    /// inserting one if absent. Idempotent: concurrent callers asking
    /// for the same key converge on one mint via moka's
    /// `get_with`/`try_get_with`, not N racing rcgen calls. When
    /// `dummy_certs_dir` is configured, a matching on-disk leaf is
    /// loaded in preference to minting, and a freshly minted leaf is
    /// written through to disk for reuse across restarts.
    pub async fn get_or_mint(
        &self,
        common_name: &str,
        sans: &[String],
    ) -> Result<Arc<LeafCert>> {
        let mut sans_sorted = sans.to_vec();
        sans_sorted.sort();
        sans_sorted.dedup();
        let key = CacheKey {
            common_name: common_name.to_string(),
            sans: sans_sorted,
            ca_fingerprint: self.ca.fingerprint,
        };

        let ca = Arc::clone(&self.ca);
        let cn = common_name.to_string();
        let sans_for_mint = sans.to_vec();
        let dummy_path = self.dummy_path(common_name);
        self.cache
            .try_get_with(key, async move {
                if let Some(path) = &dummy_path {
                    match load_cert_override(path) {
                        Ok(leaf) => {
                            debug!(common_name = %cn, path = %path.display(), "loaded cached leaf from disk");
                            return Ok(Arc::new(leaf));
                        }
                        Err(_) if !path.exists() => {}
                        Err(e) => warn!(path = %path.display(), error = %e, "unreadable cached leaf, re-minting"),
                    }
                }
                let leaf = ca.sign_leaf(&cn, &sans_for_mint)?;
                if let Some(path) = &dummy_path {
                    if let Err(e) = write_leaf(path, &leaf) {
                        warn!(path = %path.display(), error = %e, "failed to persist minted leaf");
                    }
                }
                Ok(Arc::new(leaf))
            })
            .await
            .map_err(|e: Arc<crate::error::Error>| {
                crate::error::Error::Certificate(e.to_string())
            })
    }

    /// Path a minted leaf for `common_name` would be persisted at, if
    /// `dummy_certs_dir` is configured.
    fn dummy_path(&self, common_name: &str) -> Option<PathBuf> {
        self.dummy_certs_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.pem", idna_host(common_name))))
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Run once at server shutdown. Moka's in-process cache needs no
    /// explicit teardown (no file handles or background connections to
    /// close, unlike the Redis-backed cache this replaced), but the
    /// hook is kept so shutdown ordering matches spec regardless of
    /// which cache backend is configured.
    pub async fn cleanup(&self) {
        self.cache.run_pending_tasks().await;
    }
}

/// Write `leaf`'s chain and private key to `path` as a combined PEM,
/// the same shape [`load_cert_override`] reads back.
fn write_leaf(path: &std::path::Path, leaf: &LeafCert) -> Result<()> {
    use std::io::Write;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = String::new();
    for cert in &leaf.0 {
        out.push_str(&pem_block("CERTIFICATE", &cert.0));
    }
    out.push_str(&pem_block("PRIVATE KEY", &leaf.1 .0));

    let tmp_path = path.with_extension("pem.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(out.as_bytes())?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn pem_block(label: &str, der: &[u8]) -> String {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(der);
    let mut block = format!("-----BEGIN {label}-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        block.push_str(std::str::from_utf8(chunk).unwrap());
        block.push('\n');
    }
    block.push_str(&format!("-----END {label}-----\n"));
    block
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::settings::TlsConfig;

    async fn store() -> CertStore {
        let dir = tempfile::tempdir().unwrap();
        let config = TlsConfig {
            ca_cert_path: dir.path().join("ca.crt"),
            ca_key_path: dir.path().join("ca.key"),
            auto_generate_ca: true,
            ..Default::default()
        };
        let ca = Arc::new(CertificateAuthority::load_or_create(&config).unwrap());
        // dir is dropped here but the CA is already loaded into memory;
        // this only exercises minting, not reload-from-disk.
        CertStore::new(ca, 16)
    }

    #[tokio::test]
    async fn mints_and_caches() {
        let store = store().await;
        let first = store.get_or_mint("example.com", &[]).await.unwrap();
        let second = store.get_or_mint("example.com", &[]).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.entry_count(), 1);
    }

    #[tokio::test]
    async fn distinct_sans_are_distinct_entries() {
        let store = store().await;
        store.get_or_mint("example.com", &[]).await.unwrap();
        store
            .get_or_mint("example.com", &["www.example.com".to_string()])
            .await
            .unwrap();
        assert_eq!(store.entry_count(), 2);
    }
}
