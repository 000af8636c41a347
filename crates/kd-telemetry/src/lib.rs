//! Logging setup for kindling services.
//!
//! Wraps `tracing-subscriber` so every binary and test initialises the same
//! way: `RUST_LOG` wins, otherwise the configured default level applies.

pub mod logging;
