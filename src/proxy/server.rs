//! Top-level proxy server: wires every core component (CertStore,
//! UpstreamCertFetcher, ServerConnectionPool, Authenticator, AppRegistry,
//! the controller channel, and the transparent-mode resolver) into one
//! [`HandlerState`], then runs the accept loop until shutdown. Grounded
//! in the teacher's `ProxyServer::new`/`start` split between
//! construction and serving.

use crate::auth;
use crate::config::settings::ProxyConfig;
use crate::error::Result;
use crate::models::{Request, Response};
use crate::proxy::app_registry::AppRegistry;
use crate::proxy::controller::{Controller, PassthroughController};
use crate::proxy::handler::HandlerState;
use crate::proxy::listener;
use crate::proxy::replay::ReplayWorker;
use crate::proxy::transparent;
use crate::tls::{rustls_config, CertStore, CertificateAuthority, UpstreamCertFetcher};
use std::sync::Arc;
use tracing::info;

pub struct ProxyServer {
    config: Arc<ProxyConfig>,
    state: Arc<HandlerState>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl ProxyServer {
    /// Build every component every handler needs, using the
    /// passthrough controller and an empty app registry. Use
    /// [`ProxyServer::with_controller`]/[`ProxyServer::with_app`] before
    /// [`ProxyServer::run`] to attach an external inspector or a local
    /// application.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        Self::build(config, Arc::new(PassthroughController), AppRegistry::new())
    }

    pub fn with_controller(config: ProxyConfig, controller: Arc<dyn Controller>) -> Result<Self> {
        Self::build(config, controller, AppRegistry::new())
    }

    pub fn with_controller_and_apps(
        config: ProxyConfig,
        controller: Arc<dyn Controller>,
        apps: AppRegistry,
    ) -> Result<Self> {
        Self::build(config, controller, apps)
    }

    fn build(config: ProxyConfig, controller: Arc<dyn Controller>, apps: AppRegistry) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let ca = Arc::new(CertificateAuthority::load_or_create(&config.tls)?);
        let cert_store = Arc::new(CertStore::with_dummy_certs_dir(
            Arc::clone(&ca),
            config.tls.cert_cache_capacity,
            config.tls.dummy_certs_dir.clone(),
        ));
        let upstream_cert_fetcher = Arc::new(UpstreamCertFetcher::new());
        let upstream_client_config = rustls_config::client_config(&config.tls)?;
        let authenticator: Arc<dyn auth::Authenticator> = Arc::from(auth::build(&config.auth_mode));
        let original_dst_resolver = Arc::from(transparent::platform_resolver());

        let cert_override = config
            .tls
            .cert_override_path
            .as_deref()
            .map(crate::tls::load_cert_override)
            .transpose()?
            .map(Arc::new);

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        let state = Arc::new(HandlerState {
            config: Arc::clone(&config),
            controller,
            cert_store,
            ca,
            upstream_cert_fetcher,
            upstream_client_config,
            app_registry: Arc::new(apps),
            authenticator,
            original_dst_resolver,
            cert_override,
            shutdown: shutdown_rx.clone(),
        });

        Ok(Self {
            config,
            state,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Run the accept loop until a shutdown is requested, either through
    /// [`ProxyServer::shutdown_handle`] or the process receiving
    /// `SIGINT`/Ctrl-C. Runs `CertStore.cleanup()` exactly once, after
    /// every in-flight handler has exited.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.listen_addr;
        let shutdown_rx = self.shutdown_rx.clone();
        let shutdown_tx = self.shutdown_tx.clone();

        let serve = listener::serve(addr, Arc::clone(&self.state), shutdown_rx);
        tokio::pin!(serve);

        tokio::select! {
            result = &mut serve => {
                result.map_err(crate::error::Error::Io)?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received Ctrl-C, shutting down");
                let _ = shutdown_tx.send(true);
                serve.await.map_err(crate::error::Error::Io)?;
            }
        }

        self.state.cert_store.cleanup().await;
        Ok(())
    }

    /// A handle callers can use to trigger shutdown from outside the
    /// running server (e.g. a management endpoint or test harness),
    /// without waiting on Ctrl-C.
    pub fn shutdown_handle(&self) -> tokio::sync::watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    /// Re-issue a previously captured request out of band, publishing
    /// the result on this server's controller, the way `RequestReplayThread`
    /// did: no pooling, no effect on any live handler's connection.
    pub async fn replay(&self, request: &Request) -> Result<Response> {
        let worker = ReplayWorker::new(Arc::clone(&self.state.upstream_client_config));
        match worker.replay(request).await {
            Ok(response) => {
                self.state.controller.on_response(response.clone()).await;
                Ok(response)
            }
            Err(e) => {
                let proxy_err = crate::error::ProxyError::bad_gateway(e.to_string());
                self.state.controller.on_error(request.conn_id, &proxy_err).await;
                Err(e)
            }
        }
    }
}
