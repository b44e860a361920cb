//! Header policy.
//!
//! # Responsibilities
//! - Set the proxy's cross-origin headers and strip upstream's copies
//! - Strip hop-by-hop headers on forwarded traffic
//! - Build X-Forwarded-For / X-Forwarded-Proto
//! - Select the headers carried across a websocket handshake in each direction
//!
//! Everything here is a pure transformation of a `HeaderMap`.

use std::net::SocketAddr;

use axum::http::{
    header::{self, HeaderName},
    HeaderMap, HeaderValue,
};

use crate::http::request::InboundMeta;

pub const ALLOW_METHODS: &str = "GET, POST, DELETE, PATCH, PUT, OPTIONS, TRACE";
pub const ALLOW_HEADERS: &str = "Authorization, Content-Type, Sentry-Trace";

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Cross-origin response headers owned by the proxy.
const CORS_HEADERS: [HeaderName; 4] = [
    header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
    header::ACCESS_CONTROL_ALLOW_HEADERS,
    header::ACCESS_CONTROL_ALLOW_METHODS,
    header::ACCESS_CONTROL_ALLOW_ORIGIN,
];

const HOP_BY_HOP: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// Set the four cross-origin headers, replacing any existing values.
///
/// The allowed origin echoes `origin` when present and non-empty, `*` otherwise.
pub fn apply_cors(headers: &mut HeaderMap, origin: Option<&HeaderValue>) {
    let origin = origin
        .filter(|value| !value.is_empty())
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));

    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOW_METHODS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOW_HEADERS),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
}

/// Remove every cross-origin header set by the upstream.
pub fn strip_cors(headers: &mut HeaderMap) {
    for name in &CORS_HEADERS {
        headers.remove(name);
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

/// True when the request asks for a websocket upgrade.
pub fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.to_ascii_lowercase().contains("websocket"))
}

/// Append the client IP to any prior X-Forwarded-For values.
pub fn x_forwarded_for(headers: &HeaderMap, remote_addr: SocketAddr) -> String {
    let client_ip = remote_addr.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    if prior.is_empty() {
        client_ip
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    }
}

pub fn forwarded_proto(tls: bool) -> &'static str {
    if tls {
        "https"
    } else {
        "http"
    }
}

/// Fold X-Forwarded-For for an ordinary forwarded request.
pub fn set_forwarded_for(headers: &mut HeaderMap, meta: &InboundMeta) {
    let Some(remote_addr) = meta.remote_addr else {
        return;
    };
    if let Ok(value) = HeaderValue::from_str(&x_forwarded_for(headers, remote_addr)) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Headers sent on the backend websocket dial.
///
/// Only protocols, cookies, Host and the forwarding headers cross over;
/// the handshake headers themselves are generated by the dialer. Requested
/// protocols are folded into one comma-separated value, in order.
pub fn dial_headers(inbound: &HeaderMap, meta: &InboundMeta) -> HeaderMap {
    let mut headers = HeaderMap::new();

    let protocols: Vec<&str> = inbound
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .collect();
    if !protocols.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&protocols.join(", ")) {
            headers.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }
    for value in inbound.get_all(header::COOKIE) {
        headers.append(header::COOKIE, value.clone());
    }
    if let Some(host) = meta.host.as_ref().filter(|host| !host.is_empty()) {
        headers.insert(header::HOST, host.clone());
    }
    if let Some(remote_addr) = meta.remote_addr {
        if let Ok(value) = HeaderValue::from_str(&x_forwarded_for(inbound, remote_addr)) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_static(forwarded_proto(meta.tls)),
    );

    headers
}

/// Headers from the backend handshake response passed to the client upgrade.
pub fn upgrade_response_headers(backend: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();

    if let Some(protocol) = backend
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .filter(|value| !value.is_empty())
    {
        headers.insert(header::SEC_WEBSOCKET_PROTOCOL, protocol.clone());
    }
    for cookie in backend.get_all(header::SET_COOKIE) {
        headers.append(header::SET_COOKIE, cookie.clone());
    }

    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(remote: &str, tls: bool) -> InboundMeta {
        InboundMeta {
            remote_addr: Some(remote.parse().unwrap()),
            tls,
            host: Some(HeaderValue::from_static("proxy.local:8080")),
        }
    }

    #[test]
    fn cors_echoes_origin() {
        let mut headers = HeaderMap::new();
        let origin = HeaderValue::from_static("https://example.com");
        apply_cors(&mut headers, Some(&origin));

        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "https://example.com");
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_METHODS], ALLOW_METHODS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_HEADERS], ALLOW_HEADERS);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
    }

    #[test]
    fn cors_defaults_to_wildcard() {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers, None);
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");

        let empty = HeaderValue::from_static("");
        apply_cors(&mut headers, Some(&empty));
        assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[test]
    fn cors_replaces_upstream_values() {
        let mut headers = HeaderMap::new();
        headers.append(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.append(
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            HeaderValue::from_static("https://evil.example"),
        );
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

        strip_cors(&mut headers);
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).is_none());
        assert!(headers.contains_key(header::CONTENT_TYPE));

        apply_cors(&mut headers, None);
        assert_eq!(headers.get_all(header::ACCESS_CONTROL_ALLOW_ORIGIN).iter().count(), 1);
    }

    #[test]
    fn hop_by_hop_includes_connection_listed_names() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, X-Trace"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::COOKIE, HeaderValue::from_static("a=b"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[header::COOKIE], "a=b");
    }

    #[test]
    fn upgrade_detection_is_case_insensitive() {
        let mut headers = HeaderMap::new();
        assert!(!is_websocket_upgrade(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("WebSocket"));
        assert!(is_websocket_upgrade(&headers));

        headers.insert(header::UPGRADE, HeaderValue::from_static("h2c"));
        assert!(!is_websocket_upgrade(&headers));
    }

    #[test]
    fn forwarded_for_appends_client_ip() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.1.1.1"));
        let remote: SocketAddr = "2.2.2.2:5555".parse().unwrap();

        assert_eq!(x_forwarded_for(&headers, remote), "1.1.1.1, 2.2.2.2");
        assert_eq!(x_forwarded_for(&HeaderMap::new(), remote), "2.2.2.2");
    }

    #[test]
    fn forwarded_for_folds_multiple_values_and_ipv6() {
        let mut headers = HeaderMap::new();
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("1.1.1.1"));
        headers.append(X_FORWARDED_FOR, HeaderValue::from_static("3.3.3.3"));
        let remote: SocketAddr = "[::1]:9000".parse().unwrap();

        assert_eq!(x_forwarded_for(&headers, remote), "1.1.1.1, 3.3.3.3, ::1");
    }

    #[test]
    fn dial_headers_carry_only_forwarded_set() {
        let mut inbound = HeaderMap::new();
        inbound.append(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat"));
        inbound.append(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("superchat"));
        inbound.append(header::COOKIE, HeaderValue::from_static("a=1"));
        inbound.append(header::COOKIE, HeaderValue::from_static("b=2"));
        inbound.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer x"));
        inbound.insert(header::SEC_WEBSOCKET_KEY, HeaderValue::from_static("dGhlIHNhbXBsZQ=="));
        inbound.insert(X_FORWARDED_FOR, HeaderValue::from_static("1.1.1.1"));

        let headers = dial_headers(&inbound, &meta("2.2.2.2:5555", true));

        let protocols: Vec<_> = headers.get_all(header::SEC_WEBSOCKET_PROTOCOL).iter().collect();
        assert_eq!(protocols, ["chat, superchat"]);
        let cookies: Vec<_> = headers.get_all(header::COOKIE).iter().collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
        assert_eq!(headers[header::HOST], "proxy.local:8080");
        assert_eq!(headers[X_FORWARDED_FOR], "1.1.1.1, 2.2.2.2");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
        assert!(headers.get(header::AUTHORIZATION).is_none());
        assert!(headers.get(header::SEC_WEBSOCKET_KEY).is_none());
    }

    #[test]
    fn dial_headers_without_remote_or_host() {
        let meta = InboundMeta::default();
        let headers = dial_headers(&HeaderMap::new(), &meta);

        assert_eq!(headers.len(), 1);
        assert_eq!(headers[X_FORWARDED_PROTO], "http");
    }

    #[test]
    fn upgrade_response_keeps_protocol_and_cookies_only() {
        let mut backend = HeaderMap::new();
        backend.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat"));
        backend.append(header::SET_COOKIE, HeaderValue::from_static("session=1"));
        backend.append(header::SET_COOKIE, HeaderValue::from_static("theme=dark"));
        backend.insert(header::SEC_WEBSOCKET_ACCEPT, HeaderValue::from_static("abc"));
        backend.insert(header::SERVER, HeaderValue::from_static("backend/1.0"));

        let headers = upgrade_response_headers(&backend);
        assert_eq!(headers.len(), 3);
        assert_eq!(headers[header::SEC_WEBSOCKET_PROTOCOL], "chat");
        assert_eq!(headers.get_all(header::SET_COOKIE).iter().count(), 2);
    }
}
