//! `cert` subcommand: standalone CA inspection/generation for
//! operational debugging. Not part of the request-handling core — an
//! operator reaches for this to pre-provision a CA before distributing
//! it to clients, or to check what's on disk.

use crate::config::settings::TlsConfig;
use crate::tls::CertificateAuthority;
use anyhow::{anyhow, Result};
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Subcommand)]
pub enum CertCommand {
    /// Generate a root CA keypair if one doesn't already exist at the
    /// given paths.
    Generate(GenerateCaArgs),

    /// Load the CA at the given paths and print its fingerprint.
    Inspect(InspectCaArgs),
}

#[derive(Debug, Args)]
pub struct GenerateCaArgs {
    #[arg(long, default_value = "ca-certs/rootCA.crt")]
    pub cacert: PathBuf,

    #[arg(long, default_value = "ca-certs/rootCA.key")]
    pub cakey: PathBuf,

    /// Overwrite an existing CA at these paths.
    #[arg(long, default_value_t = false)]
    pub force: bool,
}

#[derive(Debug, Args)]
pub struct InspectCaArgs {
    #[arg(long, default_value = "ca-certs/rootCA.crt")]
    pub cacert: PathBuf,

    #[arg(long, default_value = "ca-certs/rootCA.key")]
    pub cakey: PathBuf,
}

impl CertCommand {
    pub fn execute(&self) -> Result<()> {
        match self {
            CertCommand::Generate(args) => generate(args),
            CertCommand::Inspect(args) => inspect(args),
        }
    }
}

fn generate(args: &GenerateCaArgs) -> Result<()> {
    if !args.force && (args.cacert.exists() || args.cakey.exists()) {
        return Err(anyhow!(
            "CA files already exist at {} / {}; pass --force to overwrite",
            args.cacert.display(),
            args.cakey.display()
        ));
    }
    if args.force {
        let _ = std::fs::remove_file(&args.cacert);
        let _ = std::fs::remove_file(&args.cakey);
    }

    let config = TlsConfig {
        ca_cert_path: args.cacert.clone(),
        ca_key_path: args.cakey.clone(),
        auto_generate_ca: true,
        ..Default::default()
    };
    let ca = CertificateAuthority::load_or_create(&config)?;
    info!(
        cert = %args.cacert.display(),
        key = %args.cakey.display(),
        fingerprint = %hex_fingerprint(&ca.fingerprint),
        "root CA ready"
    );
    Ok(())
}

fn inspect(args: &InspectCaArgs) -> Result<()> {
    if !ca_files_exist(&args.cacert, &args.cakey) {
        return Err(anyhow!(
            "CA not found at {} / {}",
            args.cacert.display(),
            args.cakey.display()
        ));
    }
    let config = TlsConfig {
        ca_cert_path: args.cacert.clone(),
        ca_key_path: args.cakey.clone(),
        auto_generate_ca: false,
        ..Default::default()
    };
    let ca = CertificateAuthority::load_or_create(&config)?;
    println!("cert: {}", args.cacert.display());
    println!("key: {}", args.cakey.display());
    println!("fingerprint: {}", hex_fingerprint(&ca.fingerprint));
    Ok(())
}

fn ca_files_exist(cert: &Path, key: &Path) -> bool {
    cert.exists() && key.exists()
}

fn hex_fingerprint(fp: &[u8; 32]) -> String {
    fp.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_then_inspect_agree_on_fingerprint() {
        let dir = tempfile::tempdir().unwrap();
        let cacert = dir.path().join("rootCA.crt");
        let cakey = dir.path().join("rootCA.key");

        generate(&GenerateCaArgs {
            cacert: cacert.clone(),
            cakey: cakey.clone(),
            force: false,
        })
        .unwrap();
        assert!(cacert.exists());
        assert!(cakey.exists());

        inspect(&InspectCaArgs { cacert, cakey }).unwrap();
    }

    #[test]
    fn generate_refuses_to_overwrite_without_force() {
        let dir = tempfile::tempdir().unwrap();
        let cacert = dir.path().join("rootCA.crt");
        let cakey = dir.path().join("rootCA.key");
        let args = GenerateCaArgs {
            cacert,
            cakey,
            force: false,
        };
        generate(&args).unwrap();
        assert!(generate(&args).is_err());
    }
}
