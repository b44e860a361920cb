//! Backend websocket dial.
//!
//! The handshake is an HTTP/1.1 upgrade sent through the upstream client.
//! Only `Sec-WebSocket-Accept` is checked: the subprotocol the backend picks,
//! or its choice of none, is the client's business.

use axum::{
    body::{self, Body},
    http::{header, HeaderMap, Method, Request, Response, StatusCode, Uri},
};
use hyper::{body::Incoming, upgrade::Upgraded};
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::{client::generate_key, derive_accept_key};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use url::Url;

use crate::error::ProxyError;
use crate::http::forward::UpstreamClient;

/// Live connection to the backend.
pub type BackendSocket = WebSocketStream<TokioIo<Upgraded>>;

/// Largest refusal body relayed to the client.
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// Attempt exactly one websocket handshake with the backend.
///
/// `headers` replace the request defaults name by name (a forwarded Host
/// wins over the one derived from the URL). Returns the socket and the
/// headers of the backend's `101` response.
///
/// A non-`101` answer is reported as [`ProxyError::HandshakeRejected`] with
/// the backend's response, no answer at all as [`ProxyError::Dial`].
pub async fn dial(
    client: &UpstreamClient,
    url: &Url,
    headers: HeaderMap,
) -> Result<(BackendSocket, HeaderMap), ProxyError> {
    let key = generate_key();
    let mut request = Request::builder()
        .method(Method::GET)
        .uri(http_target(url)?)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_VERSION, "13")
        .header(header::SEC_WEBSOCKET_KEY, key.as_str())
        .body(Body::empty())
        .map_err(|e| handshake_error(url, e))?;
    request.headers_mut().extend(headers);

    let response = client
        .request(request)
        .await
        .map_err(|source| ProxyError::Dial {
            url: url.to_string(),
            source,
        })?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(rejected(url, response).await);
    }

    let expected = derive_accept_key(key.as_bytes());
    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .is_some_and(|value| value.as_bytes() == expected.as_bytes());
    if !accepted {
        return Err(handshake_error(url, "missing or wrong Sec-WebSocket-Accept"));
    }

    let handshake = response.headers().clone();
    let upgraded = hyper::upgrade::on(response)
        .await
        .map_err(|e| handshake_error(url, e))?;
    let socket =
        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Client, None).await;

    Ok((socket, handshake))
}

/// The HTTP URL the upgrade request is sent to: ws → http, wss → https.
fn http_target(url: &Url) -> Result<Uri, ProxyError> {
    let mut target = url.clone();
    let scheme = if url.scheme() == "wss" { "https" } else { "http" };
    let _ = target.set_scheme(scheme);
    Ok(target.as_str().parse::<Uri>()?)
}

fn handshake_error(url: &Url, reason: impl ToString) -> ProxyError {
    ProxyError::Handshake {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

async fn rejected(url: &Url, response: Response<Incoming>) -> ProxyError {
    let (parts, incoming) = response.into_parts();
    let body = body::to_bytes(Body::new(incoming), MAX_REJECTION_BODY)
        .await
        .unwrap_or_default();
    tracing::debug!(backend = %url, status = %parts.status, "Backend refused the upgrade");

    ProxyError::HandshakeRejected {
        url: url.to_string(),
        response: Response::from_parts(parts, body),
    }
}
