//! Client-facing surface of kindling.
//!
//! - [`protocol`]: terminal event wire types
//! - [`terminal_bridge`]: per-connection terminal handling, independent of transport
//! - [`http_api`]: axum router for the environment API
//! - [`terminal_ws`]: WebSocket transport for the terminal bridge
//! - [`api_error`]: mapping of lifecycle errors onto HTTP responses

pub mod api_error;
pub mod http_api;
pub mod protocol;
pub mod terminal_bridge;
pub mod terminal_ws;
