//! Per-connection proxy engine: intake, TLS interception, controller
//! publication, upstream forwarding, and keep-alive/response handling.

pub mod app_registry;
pub mod connection_pool;
pub mod controller;
pub mod handler;
pub mod listener;
pub mod replay;
pub mod request_reader;
pub mod response;
pub mod server;
pub mod transparent;

pub use controller::{Controller, PassthroughController};
pub use handler::HandlerState;
pub use server::ProxyServer;
