//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with the proxy handler
//! - Wire up middleware (CORS, tracing)
//! - Bind server to listener
//! - Dispatch each request to the forwarder or the websocket tunnel

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware,
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;

use crate::config::{validate_config, ConfigError, ProxyConfig, ValidationError};
use crate::http::forward::{self, UpstreamClient};
use crate::http::headers;
use crate::http::middleware::cors_middleware;
use crate::http::request::InboundMeta;
use crate::http::upstream::Upstream;
use crate::http::websocket::{self, session::SessionTracker};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub upstream: Arc<Upstream>,
    pub client: UpstreamClient,
    pub sessions: SessionTracker,
    pub tunnel_idle: Option<Duration>,
}

/// HTTP server for the proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    sessions: SessionTracker,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ProxyConfig) -> Result<Self, ConfigError> {
        validate_config(&config).map_err(ConfigError::Validation)?;
        let base = config.upstream_url().map_err(|e| {
            ConfigError::Validation(vec![ValidationError::new("upstream.url", e.to_string())])
        })?;

        let upstream = Arc::new(Upstream::new(base, config.upstream.preserve_host));
        let sessions = SessionTracker::new();

        let state = AppState {
            upstream,
            client: forward::upstream_client(),
            sessions: sessions.clone(),
            tunnel_idle: config.timeouts.tunnel_idle(),
        };

        let router = Self::build_router(state);
        Ok(Self {
            router,
            config,
            sessions,
        })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/{*path}", any(proxy_handler))
            .route("/", any(proxy_handler))
            .with_state(state)
            .layer(middleware::from_fn(cors_middleware))
            .layer(TraceLayer::new_for_http())
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            upstream = %self.config.upstream.url,
            "HTTP server starting"
        );

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("Shutdown signal received");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// Live tunnel sessions.
    pub fn sessions(&self) -> SessionTracker {
        self.sessions.clone()
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

/// Route each request: upgrades to the tunnel, everything else to the forwarder.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let meta = InboundMeta::of(&request);

    tracing::debug!(
        method = %request.method(),
        path = %request.uri().path(),
        "Proxying request"
    );

    let result = if headers::is_websocket_upgrade(request.headers()) {
        websocket::proxy_websocket(
            &state.client,
            &state.upstream,
            &state.sessions,
            state.tunnel_idle,
            &meta,
            request,
        )
        .await
    } else {
        forward::forward(&state.client, &state.upstream, &meta, request).await
    };

    result.unwrap_or_else(IntoResponse::into_response)
}
