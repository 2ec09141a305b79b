//! Header classification helpers shared between the request and
//! response forwarding paths.

/// Hop-by-hop headers per RFC 7230 §6.1: meaningful only between one
/// transport hop and the next, so they must never be copied from a
/// request/response onto the next hop's message.
pub fn is_hop_by_hop_header(name: &str) -> bool {
    let hop_by_hop = [
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];
    hop_by_hop.contains(&name.to_ascii_lowercase().as_str())
}

/// Whether a request header should be copied onto the outgoing
/// upstream request. Beyond hop-by-hop headers, this drops the two
/// headers the proxy sets explicitly itself (`Host`, `Content-Length`);
/// everything else the client sent is forwarded verbatim.
pub fn should_forward_request_header(name: &str) -> bool {
    let name_lower = name.to_ascii_lowercase();
    !is_hop_by_hop_header(&name_lower) && name_lower != "host" && name_lower != "content-length"
}

/// Whether a response header should be relayed back to the client.
pub fn should_forward_response_header(name: &str) -> bool {
    !is_hop_by_hop_header(name)
}

/// Parse a `CONNECT` target of the form `host:port`.
pub fn parse_connect_target(target: &str) -> Result<(String, u16), String> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| format!("invalid CONNECT target: {target}"))?;
    let port: u16 = port
        .parse()
        .map_err(|_| format!("invalid CONNECT port: {target}"))?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_filtered() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("TE"));
        assert!(!is_hop_by_hop_header("accept"));
    }

    #[test]
    fn host_and_content_length_are_not_forwarded() {
        assert!(!should_forward_request_header("Host"));
        assert!(!should_forward_request_header("Content-Length"));
        assert!(should_forward_request_header("Accept"));
    }

    #[test]
    fn parses_connect_target() {
        assert_eq!(
            parse_connect_target("example.com:443").unwrap(),
            ("example.com".to_string(), 443)
        );
        assert!(parse_connect_target("example.com").is_err());
    }
}
