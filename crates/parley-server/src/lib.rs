//! # parley-server
//!
//! WebSocket gateway around the Parley presence and messaging router.

pub mod config;
pub mod handlers;
pub mod metrics;

pub use handlers::{build_app, run_server, serve, AppState, ConnectParams};
