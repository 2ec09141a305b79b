//! Error synthesis and wire serialization for this crate's [`Response`]
//! model, grounded in the original's `send_error`: a small HTML body, a
//! `Content-Length`, and whatever extra headers the error carries (e.g.
//! `Proxy-Authenticate`).

use crate::error::ProxyError;
use crate::models::{HeaderList, Response};
use bytes::Bytes;
use chrono::Utc;
use hyper::StatusCode;

/// Turn a [`ProxyError`] into a synthesized [`Response`] the handler
/// can send directly to the client.
pub fn synthesize_error(error: &ProxyError, request_id: crate::models::ReqId) -> Response {
    let status =
        StatusCode::from_u16(error.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let reason = status.canonical_reason().unwrap_or("Error").to_string();
    let body = format!(
        "<html><head><title>{code} {reason}</title></head>\
         <body><h1>{code} {reason}</h1><p>{message}</p></body></html>",
        code = status.as_u16(),
        reason = reason,
        message = html_escape(&error.message),
    );
    let mut headers: HeaderList = vec![
        ("Server".to_string(), "mitm-proxy-core".to_string()),
        ("Content-Type".to_string(), "text/html".to_string()),
        ("Content-Length".to_string(), body.len().to_string()),
        ("Connection".to_string(), "close".to_string()),
    ];
    headers.extend(error.headers.iter().cloned());

    Response {
        request_id,
        status: status.as_u16(),
        reason,
        http_version: "HTTP/1.1".to_string(),
        headers,
        body: Bytes::from(body),
        timestamp: Utc::now(),
    }
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Serialize `response` directly onto `writer` as an HTTP/1.1 message.
/// Used by the handler's own request loop, which drives the socket
/// itself rather than handing it to a `hyper::server` connection.
pub async fn write_response<W: tokio::io::AsyncWrite + Unpin>(
    writer: &mut W,
    response: &Response,
) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut head = format!(
        "{} {} {}\r\n",
        response.http_version, response.status, response.reason
    );
    for (name, value) in &response.headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str("\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.write_all(&response.body).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_error_has_content_length_and_close() {
        let err = ProxyError::bad_gateway("upstream unreachable");
        let resp = synthesize_error(&err, crate::models::ReqId::new());
        assert_eq!(resp.status, 502);
        assert_eq!(
            crate::models::header_get(&resp.headers, "connection"),
            Some("close")
        );
        assert_eq!(
            crate::models::header_get(&resp.headers, "content-length"),
            Some(resp.body.len().to_string().as_str())
        );
    }

    #[test]
    fn error_message_is_html_escaped() {
        let err = ProxyError::bad_request("<script>");
        let resp = synthesize_error(&err, crate::models::ReqId::new());
        let body = String::from_utf8(resp.body.to_vec()).unwrap();
        assert!(!body.contains("<script>"));
        assert!(body.contains("&lt;script&gt;"));
    }
}
