//! Utility functions for the proxy server

pub mod http;
pub mod url;

pub use http::*;
pub use url::*;
