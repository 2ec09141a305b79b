//! The per-connection state machine: accept, read a request, consult
//! the app registry and controller, forward (or intercept), respond,
//! and decide whether to keep the connection alive — the same loop
//! the original `ProxyHandler.handle`/`handle_request` ran, now built
//! from owned state passed through each published event rather than a
//! shared, mutated `ClientConnect`.

use crate::auth::Authenticator;
use crate::config::settings::{AuthMode, IntakeMode, ProxyConfig};
use crate::error::ProxyError;
use crate::models::{
    header_get, header_remove, header_set, ClientConnect, ClientDisconnect, ConnId, HeaderList,
    ReqId, Request, Response, Scheme,
};
use crate::proxy::app_registry::AppRegistry;
use crate::proxy::connection_pool::ServerConnectionPool;
use crate::proxy::controller::{Controller, RequestDisposition, ResponseDisposition};
use crate::proxy::request_reader::{self, RequestTarget};
use crate::proxy::response;
use crate::proxy::transparent::OriginalDestinationResolver;
use crate::tls::{CertStore, CertificateAuthority, MaybeTlsStream, UpstreamCertFetcher};
use bytes::Bytes;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

pub struct HandlerState {
    pub config: Arc<ProxyConfig>,
    pub controller: Arc<dyn Controller>,
    pub cert_store: Arc<CertStore>,
    pub ca: Arc<CertificateAuthority>,
    pub upstream_cert_fetcher: Arc<UpstreamCertFetcher>,
    pub upstream_client_config: Arc<tokio_rustls::rustls::ClientConfig>,
    pub app_registry: Arc<AppRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    pub original_dst_resolver: Arc<dyn OriginalDestinationResolver>,
    /// Loaded once at startup from `--cert`, if given. When present,
    /// every intercepted connection presents this chain instead of a
    /// freshly minted one.
    pub cert_override: Option<Arc<crate::tls::cert_store::LeafCert>>,
    /// Flips to `true` once the server starts shutting down. Checked
    /// between exchanges so a draining handler finishes whatever
    /// request it is already serving and then closes, rather than
    /// picking up a new one.
    pub shutdown: tokio::sync::watch::Receiver<bool>,
}

/// Handles one accepted TCP connection end to end: publishes
/// `ClientConnect`, serves requests until the connection closes for any
/// reason, then publishes `ClientDisconnect` with the final exchange
/// count.
pub async fn handle_connection(state: Arc<HandlerState>, stream: TcpStream, client_addr: SocketAddr) {
    let conn_id = ConnId::new();
    let _ = stream.set_nodelay(true);

    let original_dst = if matches!(state.config.intake_mode, IntakeMode::Transparent) {
        state.original_dst_resolver.resolve(&stream).ok()
    } else {
        None
    };

    let is_transparent_tls = original_dst
        .map(|addr| state.config.transparent_tls_ports.contains(&addr.port()))
        .unwrap_or(false);

    let request_count = if is_transparent_tls {
        let addr = original_dst.expect("is_transparent_tls implies original_dst is Some");
        let cn_host = addr.ip().to_string();
        match terminate_transparent_tls(&state, conn_id, stream, &cn_host, addr.port()).await {
            Some((tls_stream, sni)) => {
                state
                    .controller
                    .on_connect(&ClientConnect {
                        id: conn_id,
                        client_addr,
                        timestamp: Utc::now(),
                        sni,
                    })
                    .await;
                info!(%conn_id, host = %cn_host, port = addr.port(), "intercepting transparent TLS connection");
                serve_loop(
                    Arc::clone(&state),
                    conn_id,
                    client_addr,
                    MaybeTlsStream::Tls(Box::new(tls_stream)),
                    Some((cn_host, addr.port())),
                    true,
                    None,
                )
                .await
            }
            None => {
                state
                    .controller
                    .on_connect(&ClientConnect {
                        id: conn_id,
                        client_addr,
                        timestamp: Utc::now(),
                        sni: None,
                    })
                    .await;
                0
            }
        }
    } else {
        state
            .controller
            .on_connect(&ClientConnect {
                id: conn_id,
                client_addr,
                timestamp: Utc::now(),
                sni: None,
            })
            .await;
        serve_loop(
            Arc::clone(&state),
            conn_id,
            client_addr,
            MaybeTlsStream::Plain(stream),
            None,
            false,
            original_dst,
        )
        .await
    };

    state
        .controller
        .on_disconnect(&ClientDisconnect {
            id: conn_id,
            timestamp: Utc::now(),
            request_count,
        })
        .await;
}

/// Serves requests on `stream` until it closes or a non-keep-alive
/// exchange completes. `fixed_target` is set once a CONNECT tunnel (or
/// transparent-mode TLS) has been established, pinning every request
/// read from here on to that host/port regardless of what the request
/// line itself says.
async fn serve_loop(
    state: Arc<HandlerState>,
    conn_id: ConnId,
    client_addr: SocketAddr,
    stream: MaybeTlsStream,
    fixed_target: Option<(String, u16)>,
    is_tls: bool,
    original_dst: Option<SocketAddr>,
) -> u64 {
    let mut reader = BufReader::new(stream);
    let mut request_count: u64 = 0;
    let mut pool = ServerConnectionPool::new(
        Arc::clone(&state.upstream_client_config),
        Arc::new(state.config.tls.clone()),
        std::time::Duration::from_secs(state.config.connect_timeout_secs),
    );

    loop {
        if *state.shutdown.borrow() {
            let _ = reader.get_mut().shutdown().await;
            return request_count;
        }

        let read_result = tokio::time::timeout(
            std::time::Duration::from_secs(state.config.request_timeout_secs),
            request_reader::read_request(&mut reader, state.config.body_size_limit),
        )
        .await;
        let parsed = match read_result {
            Err(_) => {
                if request_count > 0 {
                    // Idle keep-alive connection timing out waiting for
                    // the next request is routine, not an error.
                    return request_count;
                }
                debug!(%conn_id, "timed out waiting for request");
                return request_count;
            }
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => {
                if request_count > 0 && e.code == 400 {
                    // A plain read failure on a connection that has
                    // already served at least one request is most
                    // likely the client simply closing its end, not a
                    // malformed request; treat it as an ordinary close.
                    return request_count;
                }
                debug!(%conn_id, error = %e, "failed to read request");
                state.controller.on_error(conn_id, &e).await;
                let resp = response::synthesize_error(&e, ReqId::new());
                let _ = response::write_response(reader.get_mut(), &resp).await;
                return request_count;
            }
        };

        if let RequestTarget::Connect { host, port } = &parsed.target {
            if fixed_target.is_some() {
                // A CONNECT inside an already-tunneled stream makes no
                // sense; treat it as a protocol error and close.
                return request_count;
            }
            return handle_connect(state, conn_id, client_addr, reader, host.clone(), *port).await
                + request_count;
        }

        let req_id = ReqId::new();
        let resolved = match &fixed_target {
            Some((host, port)) => Ok((host.clone(), *port, match &parsed.target {
                RequestTarget::Origin(p) => p.clone(),
                RequestTarget::Absolute(url) => url.path().to_string(),
                RequestTarget::Connect { .. } => unreachable!(),
            })),
            None => request_reader::resolve_target(
                &parsed.target,
                &parsed.headers,
                &state.config.intake_mode,
                original_dst,
                is_tls,
            ),
        };

        let (host, port, path) = match resolved {
            Ok(t) => t,
            Err(e) => {
                state.controller.on_error(conn_id, &e).await;
                let resp = response::synthesize_error(&e, req_id);
                let _ = response::write_response(reader.get_mut(), &resp).await;
                return request_count;
            }
        };

        let request = Request {
            id: req_id,
            conn_id,
            method: parsed.method,
            scheme: if is_tls { Scheme::Https } else { Scheme::Http },
            host,
            port,
            path,
            http_version: parsed.http_version.clone(),
            headers: parsed.headers,
            body: parsed.body,
            timestamp: Utc::now(),
            client_addr,
        };

        let keep_alive_requested = is_keep_alive(&request.http_version, &request.headers);

        let response = match process_exchange(&state, request, &mut pool).await {
            Some(response) => response,
            None => {
                // Controller asked for the connection to be dropped
                // silently: write nothing, close now.
                let _ = reader.get_mut().shutdown().await;
                return request_count;
            }
        };

        let close = !keep_alive_requested
            || header_get(&response.headers, "connection")
                .map(|v| v.eq_ignore_ascii_case("close"))
                .unwrap_or(false);

        if response::write_response(reader.get_mut(), &response).await.is_err() {
            return request_count + 1;
        }
        request_count += 1;

        if close {
            let _ = reader.get_mut().shutdown().await;
            return request_count;
        }
    }
}

/// Runs one request through authentication, the app registry shortcut,
/// and (failing that) the controller and upstream forward.
async fn process_exchange(
    state: &Arc<HandlerState>,
    mut request: Request,
    pool: &mut ServerConnectionPool,
) -> Option<Response> {
    if matches!(state.config.intake_mode, IntakeMode::Explicit)
        && !matches!(state.config.auth_mode, AuthMode::None)
    {
        if let Err(e) = state.authenticator.authenticate(&request.headers) {
            state.controller.on_error(request.conn_id, &e).await;
            return Some(response::synthesize_error(&e, request.id));
        }
        // Authenticated; the credentials have served their purpose and
        // must not reach the controller or the origin.
        header_remove(&mut request.headers, "proxy-authorization");
    }

    if let Some(app) = state.app_registry.get(&request) {
        return Some(app.handle(&request).await);
    }

    let request_id = request.id;
    let conn_id = request.conn_id;
    let disposition = state.controller.on_request(request).await;
    let (host, port, request) = match disposition {
        RequestDisposition::Respond(response) => return Some(response),
        RequestDisposition::Reject(e) => {
            state.controller.on_error(conn_id, &e).await;
            return Some(response::synthesize_error(&e, request_id));
        }
        RequestDisposition::Drop => return None,
        RequestDisposition::Forward(request) => {
            (request.host.clone(), request.port, request)
        }
    };

    match forward(state, &host, port, &request, pool).await {
        Ok(response) => match state.controller.on_response(response).await {
            ResponseDisposition::Forward(response) | ResponseDisposition::Substitute(response) => {
                Some(response)
            }
            ResponseDisposition::Drop => None,
        },
        Err(e) => {
            state.controller.on_error(request.conn_id, &e).await;
            Some(response::synthesize_error(&e, request_id))
        }
    }
}

async fn forward(
    state: &Arc<HandlerState>,
    host: &str,
    port: u16,
    request: &Request,
    pool: &mut ServerConnectionPool,
) -> Result<Response, ProxyError> {
    let sender = pool
        .get(host, port, request.scheme == Scheme::Https)
        .await
        .map_err(|e| ProxyError::bad_gateway(e.to_string()))?;

    let mut headers: HeaderList = request
        .headers
        .iter()
        .filter(|(name, _)| crate::utils::http::should_forward_request_header(name))
        .cloned()
        .collect();
    header_set(&mut headers, "host", request.target_authority());
    header_set(&mut headers, "content-length", request.body.len().to_string());

    let mut builder = hyper::Request::builder()
        .method(request.method.as_str())
        .uri(&request.path);
    for (name, value) in &headers {
        builder = builder.header(name, value);
    }
    let hyper_request = builder
        .body(hyper::Body::from(request.body.clone()))
        .map_err(|e| ProxyError::bad_request(format!("malformed request: {e}")))?;

    let hyper_response = sender
        .send_request(hyper_request)
        .await
        .map_err(|e| ProxyError::bad_gateway(format!("upstream request failed: {e}")))?;

    let status = hyper_response.status().as_u16();
    let reason = hyper_response
        .status()
        .canonical_reason()
        .unwrap_or("")
        .to_string();
    let http_version = format!("{:?}", hyper_response.version());
    let upstream_wants_close = hyper_response
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
        || hyper_response.version() == hyper::Version::HTTP_10;
    let mut response_headers: HeaderList = hyper_response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .filter(|(name, _)| crate::utils::http::should_forward_response_header(name))
        .collect();
    if upstream_wants_close {
        header_set(&mut response_headers, "connection", "close");
    }
    let body = hyper::body::to_bytes(hyper_response.into_body())
        .await
        .map_err(|e| ProxyError::bad_gateway(format!("reading upstream body: {e}")))?;
    header_set(&mut response_headers, "content-length", body.len().to_string());

    Ok(Response {
        request_id: request.id,
        status,
        reason,
        http_version,
        headers: response_headers,
        body: Bytes::from(body),
        timestamp: Utc::now(),
    })
}

/// Responds `200 Connection Established` to a `CONNECT`, then
/// terminates TLS on the same socket using a leaf minted for the
/// client's requested SNI (falling back to the CONNECT host when no
/// SNI is sent), and recurses into `serve_loop` over the decrypted
/// stream.
async fn handle_connect(
    state: Arc<HandlerState>,
    conn_id: ConnId,
    client_addr: SocketAddr,
    mut reader: BufReader<MaybeTlsStream>,
    host: String,
    port: u16,
) -> u64 {
    let established = Response {
        request_id: ReqId::new(),
        status: 200,
        reason: "Connection Established".to_string(),
        http_version: "HTTP/1.1".to_string(),
        headers: vec![],
        body: Bytes::new(),
        timestamp: Utc::now(),
    };
    if response::write_response(reader.get_mut(), &established)
        .await
        .is_err()
    {
        return 0;
    }

    let plain = match reader.into_inner() {
        MaybeTlsStream::Plain(stream) => stream,
        MaybeTlsStream::Tls(_) => {
            warn!(%conn_id, "CONNECT received inside an already-terminated TLS tunnel");
            return 0;
        }
    };

    let tls_stream = match terminate_tls(&state, conn_id, plain, &host, port).await {
        Some(stream) => stream,
        None => return 0,
    };

    info!(%conn_id, host, port, "intercepting TLS connection");

    serve_loop(
        state,
        conn_id,
        client_addr,
        MaybeTlsStream::Tls(Box::new(tls_stream)),
        Some((host, port)),
        true,
        None,
    )
    .await
}

/// Mints (or loads the override) leaf certificate for `cn_host` and
/// builds the rustls `ServerConfig` to present it with.
async fn mint_server_config(
    state: &Arc<HandlerState>,
    conn_id: ConnId,
    cn_host: &str,
    port: u16,
) -> Option<Arc<tokio_rustls::rustls::ServerConfig>> {
    let (chain, key) = if let Some(leaf) = &state.cert_override {
        (leaf.0.clone(), leaf.1.clone())
    } else {
        let sans = if state.config.tls.no_upstream_cert {
            Vec::new()
        } else {
            state
                .upstream_cert_fetcher
                .fetch_sans_lenient(cn_host, port)
                .await
        };

        let effective_host = crate::utils::url::idna_host(cn_host);
        match state.cert_store.get_or_mint(&effective_host, &sans).await {
            Ok(leaf) => (leaf.0.clone(), leaf.1.clone()),
            Err(e) => {
                warn!(%conn_id, error = %e, "failed to mint leaf certificate");
                return None;
            }
        }
    };

    match crate::tls::rustls_config::server_config(chain, key) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            warn!(%conn_id, error = %e, "failed to build TLS server config");
            None
        }
    }
}

/// Terminates TLS on `plain` with a leaf certificate minted for
/// `cn_host`. Used by `handle_connect`, where the host is already known
/// from the CONNECT request line and no SNI sniffing is needed.
async fn terminate_tls(
    state: &Arc<HandlerState>,
    conn_id: ConnId,
    plain: TcpStream,
    cn_host: &str,
    port: u16,
) -> Option<tokio_rustls::server::TlsStream<TcpStream>> {
    let server_config = mint_server_config(state, conn_id, cn_host, port).await?;
    let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
    match acceptor.accept(plain).await {
        Ok(stream) => Some(stream),
        Err(e) => {
            debug!(%conn_id, error = %e, "TLS handshake with client failed");
            None
        }
    }
}

/// Terminates TLS on `plain` for transparent mode, where only an IP is
/// known up front. Uses `LazyConfigAcceptor` to read the `ClientHello`
/// before committing to a `ServerConfig`, so the minted leaf's CN can
/// reflect the client's actual SNI rather than the bare original
/// destination IP. Returns the completed stream along with the SNI
/// observed, if any, for the `ClientConnect` event.
async fn terminate_transparent_tls(
    state: &Arc<HandlerState>,
    conn_id: ConnId,
    plain: TcpStream,
    fallback_host: &str,
    port: u16,
) -> Option<(tokio_rustls::server::TlsStream<TcpStream>, Option<String>)> {
    let acceptor =
        tokio_rustls::LazyConfigAcceptor::new(tokio_rustls::rustls::server::Acceptor::default(), plain);
    let start = match acceptor.await {
        Ok(start) => start,
        Err(e) => {
            debug!(%conn_id, error = %e, "failed to read ClientHello");
            return None;
        }
    };

    let sni = start.client_hello().server_name().map(|s| s.to_string());
    let effective_cn = sni.as_deref().unwrap_or(fallback_host);
    let server_config = mint_server_config(state, conn_id, effective_cn, port).await?;

    match start.into_stream(server_config).await {
        Ok(stream) => Some((stream, sni)),
        Err(e) => {
            debug!(%conn_id, error = %e, "TLS handshake with client failed");
            None
        }
    }
}

fn is_keep_alive(http_version: &str, headers: &HeaderList) -> bool {
    match header_get(headers, "connection") {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => http_version != "HTTP/1.0",
    }
}
