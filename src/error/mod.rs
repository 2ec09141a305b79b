//! Error handling module for the proxy server.
//!
//! Two error types live here. [`Error`] is the crate-wide error for
//! startup, configuration, and anything else that never reaches a client
//! socket. [`ProxyError`] is narrower: it is the only error type the
//! request-handling path is allowed to produce, and it carries enough
//! (an HTTP status, a message, optional extra headers) that the handler
//! can always turn one into a well-formed response instead of just
//! dropping the connection.

use thiserror::Error;
use tokio::time::error::Elapsed;

/// Custom error type for the proxy server
#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Upstream connection error: {0}")]
    UpstreamConnection(String),

    #[error("Request processing error: {0}")]
    RequestProcessing(String),

    #[error("Response processing error: {0}")]
    ResponseProcessing(String),

    #[error("Logging error: {0}")]
    Logging(String),

    #[error("Unknown error: {0}")]
    Unknown(String),

    #[error("Timeout error: {0}")]
    Timeout(#[from] Elapsed),
}

/// Result type for the proxy server
pub type Result<T> = std::result::Result<T, Error>;

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Unknown(err.to_string())
    }
}

/// A client-facing error: the only error type the per-connection request
/// path produces. `code` is the HTTP status the handler will synthesize a
/// response for; `headers` lets a producer (e.g. the controller, or an
/// auth check) force extra response headers like `Proxy-Authenticate`
/// onto that synthesized response.
#[derive(Error, Debug, Clone)]
#[error("{code} {message}")]
pub struct ProxyError {
    pub code: u16,
    pub message: String,
    pub headers: Vec<(String, String)>,
}

impl ProxyError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            headers: Vec::new(),
        }
    }

    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(502, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn gateway_timeout(message: impl Into<String>) -> Self {
        Self::new(504, message)
    }

    pub fn proxy_auth_required(message: impl Into<String>, realm: &str) -> Self {
        Self::new(407, message).with_headers(vec![(
            "Proxy-Authenticate".to_string(),
            format!("Basic realm=\"{realm}\""),
        )])
    }

    pub fn payload_too_large(message: impl Into<String>) -> Self {
        Self::new(413, message)
    }
}
