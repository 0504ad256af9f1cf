//! HTTP surface for the shale archive.
//!
//! Routes, the bearer-token authentication gate, the streaming push/pull
//! pipeline with idle-tick timeouts, and server configuration. The
//! binary in `main.rs` wires a storage backend and an authenticator into
//! [`routes::AppState`] and serves it.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod stream;

pub use config::{ConfigError, ShaleConfig};
pub use error::ApiError;
pub use routes::{router, AppState};
