//! Request middleware applied in front of the proxy handler.

pub mod cors;

pub use cors::cors_middleware;
