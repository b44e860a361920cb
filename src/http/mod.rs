//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (Axum setup, dispatch)
//!     → middleware/cors.rs (preflight answer, CORS headers on the way out)
//!     → request.rs (remote address, TLS flag, Host)
//!     → upstream.rs (target URI for the configured base)
//!     → forward.rs (single upstream request) | websocket/ (tunnel)
//!     → Send to client
//! ```

pub mod forward;
pub mod headers;
pub mod middleware;
pub mod request;
pub mod server;
pub mod upstream;
pub mod websocket;

pub use request::{InboundMeta, TlsTerminated};
pub use server::{AppState, HttpServer};
pub use upstream::Upstream;
