//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via `tracing`)
//!     → tower-http TraceLayer (one span per request)
//!
//! Consumers:
//!     → stdout, pretty or JSON lines
//! ```
//!
//! # Design Decisions
//! - Structured fields (session_id, direction, error) rather than formatted text
//! - `RUST_LOG` overrides the configured level

pub mod logging;

pub use logging::init_logging;
