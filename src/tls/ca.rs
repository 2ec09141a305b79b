//! Certificate authority used to sign forged leaf certificates.
//!
//! Loads a CA keypair from disk, or generates and persists one if
//! absent (the one CA-lifecycle step this crate takes on; see
//! DESIGN.md's Open Question decisions for why that doesn't conflict
//! with the "CA generation" Non-goal).

use crate::config::settings::TlsConfig;
use crate::error::{Error, Result};
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// A loaded, ready-to-sign certificate authority.
pub struct CertificateAuthority {
    cert: Certificate,
    /// SHA-256 fingerprint of the CA certificate DER, used as part of
    /// the cert store's cache key so a CA rotation invalidates every
    /// previously minted leaf.
    pub fingerprint: [u8; 32],
}

impl CertificateAuthority {
    /// Load the CA from `config`, generating and persisting one first
    /// if it doesn't exist and `auto_generate_ca` allows it.
    pub fn load_or_create(config: &TlsConfig) -> Result<Self> {
        if config.ca_cert_path.exists() && config.ca_key_path.exists() {
            return Self::load(&config.ca_cert_path, &config.ca_key_path);
        }
        if !config.auto_generate_ca {
            return Err(Error::Certificate(format!(
                "CA files not found ({}, {}) and auto_generate_ca is disabled",
                config.ca_cert_path.display(),
                config.ca_key_path.display()
            )));
        }
        warn!(
            cert = %config.ca_cert_path.display(),
            key = %config.ca_key_path.display(),
            "root CA not found, generating one"
        );
        Self::generate_and_save(&config.ca_cert_path, &config.ca_key_path)
    }

    fn load(cert_path: &std::path::Path, key_path: &std::path::Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        let key_pair = KeyPair::from_pem(&key_pem)
            .map_err(|e| Error::Certificate(format!("invalid CA private key: {e}")))?;
        let params = CertificateParams::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| Error::Certificate(format!("invalid CA certificate: {e}")))?;
        let cert = Certificate::from_params(params)
            .map_err(|e| Error::Certificate(format!("failed to load CA: {e}")))?;
        let fingerprint = fingerprint_der(
            &cert
                .serialize_der()
                .map_err(|e| Error::Certificate(e.to_string()))?,
        );
        info!(cert = %cert_path.display(), "loaded root CA");
        Ok(Self { cert, fingerprint })
    }

    fn generate_and_save(
        cert_path: &std::path::Path,
        key_path: &std::path::Path,
    ) -> Result<Self> {
        let mut params = CertificateParams::new(vec![]);
        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "mitm-proxy-core generated CA");
        dn.push(DnType::CommonName, "mitm-proxy-core root CA");
        params.distinguished_name = dn;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];
        let now = SystemTime::now();
        params.not_before = now.into();
        params.not_after = (now + Duration::from_secs(20 * 365 * 24 * 60 * 60)).into();

        let cert = Certificate::from_params(params)
            .map_err(|e| Error::Certificate(format!("failed to generate CA: {e}")))?;

        if let Some(parent) = cert_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if let Some(parent) = key_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(
            cert_path,
            cert.serialize_pem()
                .map_err(|e| Error::Certificate(e.to_string()))?,
        )?;
        std::fs::write(key_path, cert.serialize_private_key_pem())?;

        let fingerprint = fingerprint_der(
            &cert
                .serialize_der()
                .map_err(|e| Error::Certificate(e.to_string()))?,
        );
        info!(cert = %cert_path.display(), "generated new root CA");
        Ok(Self { cert, fingerprint })
    }

    /// Sign a leaf certificate for `common_name` covering `sans`,
    /// returning the DER chain (leaf then CA) and the leaf's DER private
    /// key, ready for `rustls::ServerConfig::with_single_cert`.
    pub fn sign_leaf(
        &self,
        common_name: &str,
        sans: &[String],
    ) -> Result<(Vec<rustls::Certificate>, rustls::PrivateKey)> {
        debug!(common_name, sans = ?sans, "minting leaf certificate");
        let mut params = CertificateParams::new(
            sans.iter()
                .cloned()
                .chain(std::iter::once(common_name.to_string()))
                .collect::<std::collections::BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>(),
        );
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::DigitalSignature,
            rcgen::KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        let now = SystemTime::now();
        params.not_before = now.into();
        params.not_after = (now + Duration::from_secs(365 * 24 * 60 * 60)).into();

        let leaf = Certificate::from_params(params)
            .map_err(|e| Error::Certificate(format!("failed to build leaf params: {e}")))?;
        let leaf_der = leaf
            .serialize_der_with_signer(&self.cert)
            .map_err(|e| Error::Certificate(format!("failed to sign leaf: {e}")))?;
        let ca_der = self
            .cert
            .serialize_der()
            .map_err(|e| Error::Certificate(e.to_string()))?;
        let key_der = leaf.serialize_private_key_der();

        Ok((
            vec![
                rustls::Certificate(leaf_der),
                rustls::Certificate(ca_der),
            ],
            rustls::PrivateKey(key_der),
        ))
    }
}

/// Load a combined cert-chain + private-key PEM file for `--cert`,
/// bypassing the CA entirely. Every intercepted connection presents this
/// same chain regardless of requested SNI.
pub fn load_cert_override(path: &std::path::Path) -> Result<(Vec<rustls::Certificate>, rustls::PrivateKey)> {
    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path).map_err(|e| Error::Certificate(format!("{}: {e}", path.display())))?,
    );
    let chain: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut reader)
        .map_err(|e| Error::Certificate(format!("invalid cert override PEM: {e}")))?
        .into_iter()
        .map(rustls::Certificate)
        .collect();
    if chain.is_empty() {
        return Err(Error::Certificate(format!(
            "{}: no certificates found",
            path.display()
        )));
    }

    let mut reader = std::io::BufReader::new(
        std::fs::File::open(path).map_err(|e| Error::Certificate(format!("{}: {e}", path.display())))?,
    );
    let key = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| Error::Certificate(format!("invalid cert override key: {e}")))?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Certificate(format!("{}: no private key found", path.display())))?;

    Ok((chain, rustls::PrivateKey(key)))
}

fn fingerprint_der(der: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    Sha256::digest(der).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_reloads_ca() {
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("ca.crt");
        let key_path = dir.path().join("ca.key");
        let config = TlsConfig {
            ca_cert_path: cert_path.clone(),
            ca_key_path: key_path.clone(),
            auto_generate_ca: true,
            ..Default::default()
        };
        let ca = CertificateAuthority::load_or_create(&config).unwrap();
        assert!(cert_path.exists());
        assert!(key_path.exists());

        let reloaded = CertificateAuthority::load_or_create(&config).unwrap();
        assert_eq!(ca.fingerprint, reloaded.fingerprint);
    }

    #[test]
    fn signs_leaf_with_requested_sans() {
        let dir = tempfile::tempdir().unwrap();
        let config = TlsConfig {
            ca_cert_path: dir.path().join("ca.crt"),
            ca_key_path: dir.path().join("ca.key"),
            auto_generate_ca: true,
            ..Default::default()
        };
        let ca = CertificateAuthority::load_or_create(&config).unwrap();
        let (chain, _key) = ca
            .sign_leaf("example.com", &["www.example.com".to_string()])
            .unwrap();
        assert_eq!(chain.len(), 2);
    }
}
