//! Core domain types for kindling.
//!
//! This crate owns everything about an environment that does not involve
//! running an external process:
//! - [`types`]: the `Environment` record and its status state machine
//! - [`store`]: the in-memory authoritative Environment Store
//! - [`cluster_config`]: Kind cluster-config document generation
//! - [`config`]: TOML configuration for the daemon
//! - [`error`]: the lifecycle error taxonomy shared by every crate

pub mod cluster_config;
pub mod config;
pub mod error;
pub mod store;
pub mod types;
