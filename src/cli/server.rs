//! `server` subcommand: the proxy's command-line options, turned into a
//! `ProxyConfig` and handed to `proxy::server::ProxyServer`.

use crate::config::settings::{parse_size, AuthMode, IntakeMode, ProxyConfig, TlsConfig};
use crate::proxy::server::ProxyServer;
use anyhow::{anyhow, Context, Result};
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

#[derive(Debug, Args)]
pub struct ServerArgs {
    /// Address the proxy listens on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: String,

    /// Load a YAML config file over these CLI-derived defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Tracing log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Directory to write rolling log files to, in addition to stderr.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// PEM with cert+key to present for all TLS interceptions, overriding
    /// forgery.
    #[arg(long)]
    pub cert: Option<PathBuf>,

    /// Directory of per-host client certs (`{idna-host}.pem`) the proxy
    /// presents when it dials upstream over TLS.
    #[arg(long)]
    pub client_certs: Option<PathBuf>,

    /// Persistent on-disk cache directory for forged leaf certificates.
    #[arg(long)]
    pub dummy_certs: Option<PathBuf>,

    /// CA certificate path; generated here if absent.
    #[arg(long, default_value = "ca-certs/rootCA.crt")]
    pub cacert: PathBuf,

    /// CA private key path; generated here if absent.
    #[arg(long, default_value = "ca-certs/rootCA.key")]
    pub cakey: PathBuf,

    /// Skip fetching the upstream certificate to harvest SANs before
    /// minting a forged leaf.
    #[arg(long, default_value_t = false)]
    pub no_upstream_cert: bool,

    /// Skip verifying the upstream server's certificate. Testing only.
    #[arg(long, default_value_t = false)]
    pub skip_upstream_cert_verify: bool,

    /// Cap on forwarded request/response body bytes (`10m`, `512k`, a bare
    /// byte count, ...).
    #[arg(long, default_value = "10m")]
    pub body_size_limit: String,

    /// Per-read/write timeout, seconds.
    #[arg(long, default_value_t = 30)]
    pub request_timeout: u64,

    /// Upstream connect timeout, seconds.
    #[arg(long, default_value_t = 10)]
    pub connect_timeout: u64,

    /// Forward every connection to one fixed upstream (`scheme://host[:port]`),
    /// regardless of what the client requested. Mutually exclusive with
    /// `--transparent`.
    #[arg(long, conflicts_with = "transparent")]
    pub reverse: Option<String>,

    /// Recover the original destination via the OS (Linux
    /// `SO_ORIGINAL_DST`) instead of trusting what the client asked for.
    /// Mutually exclusive with `--reverse`.
    #[arg(long, default_value_t = false, conflicts_with = "reverse")]
    pub transparent: bool,

    /// Original-destination ports treated as TLS in transparent mode,
    /// comma-separated.
    #[arg(long, default_value = "443", value_delimiter = ',')]
    pub transparent_tls_ports: Vec<u16>,

    /// Require Basic auth, but accept any username/password (still
    /// demands the header be present).
    #[arg(
        long,
        default_value_t = false,
        conflicts_with_all = ["singleuser", "htpasswd"]
    )]
    pub nonanonymous: bool,

    /// Require Basic auth against one hardcoded `user:pass` pair.
    #[arg(long, conflicts_with_all = ["nonanonymous", "htpasswd"])]
    pub singleuser: Option<String>,

    /// Require Basic auth checked against an htpasswd-format file.
    #[arg(long, conflicts_with_all = ["nonanonymous", "singleuser"])]
    pub htpasswd: Option<PathBuf>,
}

impl ServerArgs {
    /// Build a `ProxyConfig` from these CLI arguments, then layer
    /// `--config` over it if given.
    pub fn to_config(&self) -> Result<ProxyConfig> {
        let listen_addr: SocketAddr = self
            .listen
            .parse()
            .map_err(|e| anyhow!("invalid --listen address '{}': {e}", self.listen))?;

        let intake_mode = match (&self.reverse, self.transparent) {
            (Some(spec), false) => IntakeMode::Reverse {
                upstream: spec.clone(),
            },
            (None, true) => IntakeMode::Transparent,
            (None, false) => IntakeMode::Explicit,
            (Some(_), true) => unreachable!("clap conflicts_with enforces mutual exclusion"),
        };

        let auth_mode = if self.nonanonymous {
            AuthMode::NonAnonymous
        } else if let Some(spec) = &self.singleuser {
            let (username, password) = spec
                .split_once(':')
                .ok_or_else(|| anyhow!("--singleuser expects user:pass"))?;
            AuthMode::SingleUser {
                username: username.to_string(),
                password: password.to_string(),
            }
        } else if let Some(path) = &self.htpasswd {
            AuthMode::Htpasswd { path: path.clone() }
        } else {
            AuthMode::None
        };

        let body_size_limit =
            parse_size(&self.body_size_limit).map_err(|e| anyhow!("--body-size-limit: {e}"))?;

        let config = ProxyConfig {
            listen_addr,
            log_level: self.log_level.clone(),
            log_dir: self.log_dir.clone(),
            intake_mode,
            auth_mode,
            tls: TlsConfig {
                ca_cert_path: self.cacert.clone(),
                ca_key_path: self.cakey.clone(),
                cert_override_path: self.cert.clone(),
                auto_generate_ca: true,
                client_certs_dir: self.client_certs.clone(),
                dummy_certs_dir: self.dummy_certs.clone(),
                no_upstream_cert: self.no_upstream_cert,
                skip_upstream_cert_verify: self.skip_upstream_cert_verify,
                cert_cache_capacity: 1024,
            },
            runtime: crate::config::settings::RuntimeConfig::default(),
            body_size_limit,
            request_timeout_secs: self.request_timeout,
            connect_timeout_secs: self.connect_timeout,
            transparent_tls_ports: self.transparent_tls_ports.clone(),
        };

        let config = match &self.config {
            Some(path) => ProxyConfig::load_from_file(path)
                .with_context(|| format!("loading --config {}", path.display()))?,
            None => config,
        };
        config.validate()?;
        Ok(config)
    }

    /// Build the config, log the effective settings, and run the proxy
    /// until shutdown.
    pub async fn run(&self) -> Result<()> {
        let config = self.to_config()?;

        info!(listen = %config.listen_addr, mode = ?config.intake_mode, "starting proxy");
        info!(
            body_size_limit = config.body_size_limit,
            cacert = %config.tls.ca_cert_path.display(),
            "effective configuration"
        );

        let server = ProxyServer::new(config).map_err(anyhow::Error::from)?;
        server.run().await.map_err(anyhow::Error::from)?;
        Ok(())
    }
}
