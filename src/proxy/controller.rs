//! The controller channel: every `ClientConnect`/`Request`/`Response`
//! (and final `ClientDisconnect`) the handler produces is published
//! here first, and the handler blocks on the reply before acting on
//! it. This is the synchronous request/reply rendezvous the original
//! proxy built around its `masterq`, generalized into a trait so the
//! "other side" can be anything: a passthrough default, an in-process
//! test double, or a process talking over a socket.

use crate::error::ProxyError;
use crate::models::{ClientConnect, ClientDisconnect, Request, Response};
use async_trait::async_trait;

/// What the controller decided to do with a published `Request`.
pub enum RequestDisposition {
    /// Forward the request as given (or mutated in place).
    Forward(Request),
    /// Respond to the client directly without contacting upstream.
    Respond(Response),
    /// Refuse to proceed; the handler synthesizes an error response.
    Reject(ProxyError),
    /// The controller channel closed, or the controller explicitly
    /// asked for the connection to be torn down; the handler writes
    /// nothing and closes silently.
    Drop,
}

/// What the controller decided to do with a published `Response`.
pub enum ResponseDisposition {
    /// Return the response as given.
    Forward(Response),
    /// Replace it with a different response entirely.
    Substitute(Response),
    /// Same drop semantics as `RequestDisposition::Drop`, applied after
    /// the origin has already answered.
    Drop,
}

/// The controller boundary. A handler publishes an event and awaits
/// exactly one disposition before continuing; nothing about the
/// handler's own state is visible to a `Controller` implementation
/// beyond what's in the published event, per the message-passing design
/// (no shared mutable connection state is handed out).
#[async_trait]
pub trait Controller: Send + Sync {
    async fn on_connect(&self, event: &ClientConnect);

    async fn on_disconnect(&self, event: &ClientDisconnect);

    async fn on_request(&self, request: Request) -> RequestDisposition;

    async fn on_response(&self, response: Response) -> ResponseDisposition;

    async fn on_error(&self, conn_id: crate::models::ConnId, error: &ProxyError);
}

/// Default controller: every event is approved unmodified. Used when no
/// external inspector is attached, and as the base case new
/// `Controller` implementations can wrap.
pub struct PassthroughController;

#[async_trait]
impl Controller for PassthroughController {
    async fn on_connect(&self, _event: &ClientConnect) {}

    async fn on_disconnect(&self, _event: &ClientDisconnect) {}

    async fn on_request(&self, request: Request) -> RequestDisposition {
        RequestDisposition::Forward(request)
    }

    async fn on_response(&self, response: Response) -> ResponseDisposition {
        ResponseDisposition::Forward(response)
    }

    async fn on_error(&self, conn_id: crate::models::ConnId, error: &ProxyError) {
        tracing::warn!(%conn_id, code = error.code, message = %error.message, "proxy error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnId, ReqId, Scheme};
    use bytes::Bytes;
    use chrono::Utc;

    fn sample_request() -> Request {
        Request {
            id: ReqId::new(),
            conn_id: ConnId::new(),
            method: "GET".to_string(),
            scheme: Scheme::Http,
            host: "example.com".to_string(),
            port: 80,
            path: "/".to_string(),
            http_version: "HTTP/1.1".to_string(),
            headers: vec![],
            body: Bytes::new(),
            timestamp: Utc::now(),
            client_addr: "127.0.0.1:1".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn passthrough_forwards_request_unmodified() {
        let controller = PassthroughController;
        let req = sample_request();
        let id = req.id;
        match controller.on_request(req).await {
            RequestDisposition::Forward(forwarded) => assert_eq!(forwarded.id, id),
            _ => panic!("expected Forward"),
        }
    }
}
