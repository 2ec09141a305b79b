//! mitm-proxy-core - An intercepting HTTP/HTTPS proxy server
//!
//! This library provides the core of a production-grade MITM proxy:
//! explicit/transparent/reverse intake, TLS interception with forged leaf
//! certificates, and a controller channel for out-of-band inspection.

pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod proxy;
pub mod tls;
pub mod utils;

// Re-export commonly used items
pub use error::{Error, Result};
pub use models::{ClientConnect, ClientDisconnect, Request, Response};
pub use proxy::server::ProxyServer;
pub use config::settings::ProxyConfig;

/// Runtime utilities for creating single-threaded vs multi-threaded Tokio runtimes
pub mod runtime {
    use crate::config::settings::RuntimeConfig;
    use tokio::runtime::{Builder, Runtime};
    use anyhow::{Result, Context};
    
    /// Create a Tokio runtime based on the configuration
    pub fn create_runtime(config: &RuntimeConfig) -> Result<Runtime> {
        match config.mode.as_str() {
            "single_threaded" => {
                tracing::info!("initializing single-threaded runtime");
                Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context("failed to create single-threaded runtime")
            }
            "multi_threaded" => {
                let mut builder = Builder::new_multi_thread();
                builder.enable_all();

                if let Some(threads) = config.worker_threads {
                    if threads > 0 {
                        tracing::info!(threads, "initializing multi-threaded runtime");
                        builder.worker_threads(threads);
                    } else {
                        tracing::info!("initializing multi-threaded runtime with auto-detected cores");
                    }
                } else {
                    tracing::info!("initializing multi-threaded runtime with auto-detected cores");
                }

                builder
                    .build()
                    .context("failed to create multi-threaded runtime")
            }
            _ => {
                tracing::warn!(mode = %config.mode, "unknown runtime mode, defaulting to multi-threaded");
                Builder::new_multi_thread()
                    .enable_all()
                    .build()
                    .context("failed to create default multi-threaded runtime")
            }
        }
    }
    
    /// Execute an async function with the configured runtime
    pub fn run_with_runtime<F, T>(config: &RuntimeConfig, future: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        let runtime = create_runtime(config)?;
        runtime.block_on(future)
    }
}

