//! Configuration types and loading.

pub mod settings;

pub use settings::{AuthMode, IntakeMode, ProxyConfig, TlsConfig};
