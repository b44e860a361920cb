//! Inbound request metadata.
//!
//! # Responsibilities
//! - Recover the client's remote address from connection info
//! - Tell whether the client connection was TLS-terminated
//! - Recover the Host the client addressed, from the header or the URI
//!
//! # Design Decisions
//! - TLS termination belongs to the host listener; it marks requests with
//!   the [`TlsTerminated`] extension and the proxy only reads the flag
//! - Missing connection info is not an error: forwarding headers are simply
//!   not computed

use std::net::SocketAddr;

use axum::{
    extract::ConnectInfo,
    http::{header, uri::Scheme, HeaderValue, Request},
};

/// Request extension set by a listener that terminated TLS for the client.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsTerminated;

/// What the proxy needs to know about the client side of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMeta {
    pub remote_addr: Option<SocketAddr>,
    pub tls: bool,
    pub host: Option<HeaderValue>,
}

impl InboundMeta {
    pub fn of<B>(request: &Request<B>) -> Self {
        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let tls = request.extensions().get::<TlsTerminated>().is_some()
            || request.uri().scheme() == Some(&Scheme::HTTPS);

        let host = request.headers().get(header::HOST).cloned().or_else(|| {
            request
                .uri()
                .authority()
                .and_then(|authority| HeaderValue::from_str(authority.as_str()).ok())
        });

        Self {
            remote_addr,
            tls,
            host,
        }
    }
}
