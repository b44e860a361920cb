//! Cross-origin middleware.
//! Makes the proxy authoritative over CORS headers and answers preflights.

use axum::{
    body::Body,
    http::{header, Method, Request},
    middleware::Next,
    response::Response,
};

use crate::http::headers;

/// Set the cross-origin headers on every response.
///
/// `OPTIONS` requests are answered here with an empty body and never reach
/// the forwarder or the websocket tunnel.
pub async fn cors_middleware(request: Request<Body>, next: Next) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();

    let mut response = if request.method() == Method::OPTIONS {
        tracing::debug!(path = %request.uri().path(), "Answering preflight");
        Response::new(Body::empty())
    } else {
        next.run(request).await
    };

    headers::apply_cors(response.headers_mut(), origin.as_ref());
    response
}
