//! # parley-server
//!
//! HTTP and WebSocket front end for the Parley relay: configuration,
//! metrics, the per-connection session loop and the axum handlers.

pub mod config;
pub mod handlers;
pub mod metrics;
pub mod session;

pub use config::Config;
pub use handlers::{app, run_server, serve, AppState};
