//! Accepts client connections and hands each one to [`handler::handle_connection`]
//! as its own task, grounded in the teacher's `create_reusable_socket` +
//! `ProxyServer::start` accept loop: a `socket2` socket so `SO_REUSEADDR`
//! (and, opt-in, `SO_REUSEPORT`) can be set before binding, converted into
//! a `tokio::net::TcpListener` for the actual accept loop.

use crate::proxy::handler::{self, HandlerState};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Bind `addr` with `SO_REUSEADDR` set, and `SO_REUSEPORT` as well when
/// `PROXY_USE_REUSEPORT=true` is set in the environment (matching the
/// teacher's opt-in behavior for multi-process deployments).
fn bind_reusable(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;

    if std::env::var("PROXY_USE_REUSEPORT").as_deref() == Ok("true") {
        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            socket.set_reuse_port(true)?;
            info!("SO_REUSEPORT enabled for multi-process binding");
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        warn!("PROXY_USE_REUSEPORT requested but not supported on this platform");
    }

    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    let std_listener = std::net::TcpListener::from(socket);
    TcpListener::from_std(std_listener)
}

/// Binds `addr` and serves accepted connections until `shutdown` fires.
/// Each accepted connection is handled on its own task; the acceptor
/// itself never touches a client socket after handing it off.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<HandlerState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = bind_reusable(addr)?;
    info!(%addr, "proxy listening");

    let mut tasks = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, client_addr)) => {
                        debug!(%client_addr, "accepted connection");
                        let state = Arc::clone(&state);
                        tasks.spawn(async move {
                            handler::handle_connection(state, stream, client_addr).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("shutdown requested, closing listener");
                    break;
                }
            }
        }
    }

    // Drain in-flight handlers: each one observes `shutdown` at its next
    // suspension point and closes on its own, so this just waits for them
    // to finish rather than aborting them.
    while tasks.join_next().await.is_some() {}

    Ok(())
}
