//! Ordinary (non-upgrade) request forwarding.
//!
//! # Responsibilities
//! - Rewrite the request target onto the upstream base URL
//! - Forward method, headers and body in a single attempt
//! - Stream the upstream response back with its CORS headers removed
//!
//! # Design Decisions
//! - No retries: a failed connection is a 503 for the client
//! - Bodies are streamed in both directions, never buffered
//! - Hop-by-hop headers are dropped in both directions

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, Version},
    response::Response,
};
use hyper::body::Incoming;
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};

use crate::error::ProxyError;
use crate::http::headers;
use crate::http::request::InboundMeta;
use crate::http::upstream::Upstream;

/// Client for every upstream connection: ordinary forwards and websocket dials.
pub type UpstreamClient = Client<HttpsConnector<HttpConnector>, Body>;

/// HTTP/1.1 client speaking plain HTTP or TLS, as the upstream URL says.
pub fn upstream_client() -> UpstreamClient {
    // Several rustls providers may be compiled in; pin one for every TLS client.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();

    Client::builder(TokioExecutor::new()).build::<_, Body>(https)
}

/// Forward one request to the upstream and return its response.
pub async fn forward(
    client: &UpstreamClient,
    upstream: &Upstream,
    meta: &InboundMeta,
    request: Request<Body>,
) -> Result<Response, ProxyError> {
    let (mut parts, body) = request.into_parts();

    parts.uri = upstream.forward_uri(&parts.uri)?;
    // The upstream leg is always HTTP/1.1, whatever the client spoke.
    parts.version = Version::HTTP_11;

    headers::strip_hop_by_hop(&mut parts.headers);
    headers::set_forwarded_for(&mut parts.headers, meta);
    if !upstream.preserve_host() {
        if let Ok(host) = HeaderValue::from_str(upstream.authority()) {
            parts.headers.insert(header::HOST, host);
        }
    }

    let uri = parts.uri.clone();
    let response: hyper::Response<Incoming> = match client.request(Request::from_parts(parts, body)).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(uri = %uri, error = %e, "Upstream request failed");
            return Err(ProxyError::UpstreamUnavailable(e));
        }
    };

    tracing::debug!(
        uri = %uri,
        status = %response.status(),
        "Upstream responded"
    );

    let (mut parts, body) = response.into_parts();
    headers::strip_cors(&mut parts.headers);
    headers::strip_hop_by_hop(&mut parts.headers);

    Ok(Response::from_parts(parts, Body::new(body)))
}
