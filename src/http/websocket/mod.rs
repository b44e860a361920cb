//! WebSocket proxy handling.
//!
//! # Responsibilities
//! - Dial the backend with translated scheme and forwarded headers
//! - Complete the upgrade handshake with the client
//! - Bidirectional message forwarding until either side terminates
//!
//! # Data Flow
//! ```text
//! upgrade request → dial.rs (backend handshake)
//!                 → client upgrade (protocol + Set-Cookie from backend)
//!                 → relay.rs (two loops, first terminal event wins)
//! Client ←──── WebSocket messages ────→ Proxy ←──── WebSocket messages ────→ Backend
//! ```
//!
//! # Design Decisions
//! - Backend is dialed before the client is upgraded, so a refused dial or a
//!   rejected handshake can still be answered with a plain HTTP response
//! - Any origin is accepted on the client upgrade
//! - Close messages propagated in both directions
//! - Ping/pong relayed like any other message

pub mod dial;
pub mod relay;
pub mod session;

use std::time::Duration;

use axum::{
    body::Body,
    extract::{ws::WebSocketUpgrade, FromRequestParts},
    http::{header, Request},
    response::Response,
};

use crate::error::ProxyError;
use crate::http::forward::UpstreamClient;
use crate::http::headers;
use crate::http::request::InboundMeta;
use crate::http::upstream::Upstream;
use crate::http::websocket::relay::TunnelEnd;
use crate::http::websocket::session::{SessionEvent, SessionTracker, SharedSession, TunnelSession};

pub use relay::{Direction, RelayOutcome};
pub use session::{SessionId, SessionState};

/// Tunnel an upgrade request to the backend.
pub async fn proxy_websocket(
    client: &UpstreamClient,
    upstream: &Upstream,
    sessions: &SessionTracker,
    idle: Option<Duration>,
    meta: &InboundMeta,
    request: Request<Body>,
) -> Result<Response, ProxyError> {
    let (mut parts, _body) = request.into_parts();
    let backend_url = upstream.websocket_url(&parts.uri);
    let mut session = TunnelSession::new(sessions.clone());

    let dial_headers = headers::dial_headers(&parts.headers, meta);
    // The upgrade extractor only reads the first protocol line.
    if let Some(protocols) = dial_headers.get(header::SEC_WEBSOCKET_PROTOCOL) {
        parts
            .headers
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocols.clone());
    }
    let (mut backend, handshake) = match dial::dial(client, &backend_url, dial_headers).await {
        Ok(connected) => {
            session.advance(SessionEvent::DialSucceeded);
            connected
        }
        Err(e) => {
            session.advance(SessionEvent::DialFailed);
            tracing::warn!(session_id = %session.id(), error = %e, "Backend dial failed");
            return Err(e);
        }
    };

    let upgrade_headers = headers::upgrade_response_headers(&handshake);

    let ws = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
        Ok(ws) => ws,
        Err(rejection) => {
            session.advance(SessionEvent::UpgradeFailed);
            let _ = backend.close(None).await;
            let e = ProxyError::from(rejection);
            tracing::error!(session_id = %session.id(), error = %e, "Client upgrade failed");
            return Err(e);
        }
    };

    let protocol = upgrade_headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let ws = match protocol {
        Some(protocol) => ws.protocols([protocol]),
        None => ws,
    };

    let session_id = session.id();
    tracing::debug!(session_id = %session_id, backend = %backend_url, "Backend connected");

    let session = SharedSession::new(session);
    let failed = session.clone();

    let mut response = ws
        .on_failed_upgrade(move |e: axum::Error| {
            failed.advance(SessionEvent::UpgradeFailed);
            tracing::error!(session_id = %session_id, error = %e, "Client upgrade failed");
        })
        .on_upgrade(move |client| async move {
            session.advance(SessionEvent::UpgradeSucceeded);
            tracing::info!(session_id = %session_id, "Tunnel established");

            let end = relay::run(client, backend, idle).await;
            session.advance(SessionEvent::RelayTerminated);

            match end {
                TunnelEnd::Relay(direction, outcome) if outcome.is_close() => {
                    tracing::debug!(
                        session_id = %session_id,
                        direction = %direction,
                        outcome = %outcome,
                        "Tunnel closed"
                    );
                }
                TunnelEnd::Relay(direction, outcome) => {
                    let e = ProxyError::Relay {
                        direction,
                        reason: outcome.to_string(),
                    };
                    tracing::warn!(session_id = %session_id, error = %e, "Tunnel relay failed");
                }
                TunnelEnd::Idle(limit) => {
                    tracing::warn!(session_id = %session_id, idle = ?limit, "Tunnel idle timeout");
                }
            }
        });

    for cookie in upgrade_headers.get_all(header::SET_COOKIE) {
        response.headers_mut().append(header::SET_COOKIE, cookie.clone());
    }
    Ok(response)
}
