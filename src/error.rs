//! Proxy error kinds and how each one reaches the client.

use axum::{
    body::{Body, Bytes},
    extract::ws::rejection::WebSocketUpgradeRejection,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::http::headers;
use crate::http::websocket::relay::Direction;

/// Errors that can occur while proxying a single request or tunnel.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The backend websocket dial failed without any backend response.
    #[error("couldn't dial {url}: {source}")]
    Dial {
        url: String,
        #[source]
        source: hyper_util::client::legacy::Error,
    },

    /// The backend switched protocols but the websocket handshake was unusable.
    #[error("bad websocket handshake from {url}: {reason}")]
    Handshake { url: String, reason: String },

    /// The backend answered the websocket handshake but refused the upgrade.
    #[error("backend {url} rejected the websocket handshake with {}", .response.status())]
    HandshakeRejected { url: String, response: Response<Bytes> },

    /// The client side of the upgrade could not be completed.
    #[error("couldn't upgrade client connection: {0}")]
    Upgrade(#[from] WebSocketUpgradeRejection),

    /// A relay loop ended with something other than a structured close.
    /// Raised after the upgrade, so it is only ever logged.
    #[error("error when copying from {direction}: {reason}")]
    Relay { direction: Direction, reason: String },

    /// An ordinary forwarded request could not reach the upstream.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(#[from] hyper_util::client::legacy::Error),

    /// The rewritten upstream URI could not be parsed.
    #[error("invalid upstream uri: {0}")]
    InvalidUpstreamUri(#[from] axum::http::uri::InvalidUri),
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        match self {
            ProxyError::Dial { .. }
            | ProxyError::Handshake { .. }
            | ProxyError::UpstreamUnavailable(_) => unavailable(),
            ProxyError::HandshakeRejected { response, .. } => rejected_handshake(response),
            ProxyError::Upgrade(rejection) => rejection.into_response(),
            ProxyError::InvalidUpstreamUri(_) => {
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
            // Log-only: the client connection is already upgraded.
            ProxyError::Relay { .. } => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

fn unavailable() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable").into_response()
}

/// Relay the backend's refusal (redirect, auth challenge, ...) to the client.
fn rejected_handshake(backend: Response<Bytes>) -> Response {
    let (mut parts, body) = backend.into_parts();
    headers::strip_hop_by_hop(&mut parts.headers);
    // The body was buffered; let hyper frame it again.
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(body))
}
