//! Environment lifecycle for kindling.
//!
//! Drives the external tools (Kind, Docker, istioctl/kubectl) that bring a
//! cluster up and down, and exposes the create/list/delete surface consumed
//! by the HTTP layer.
//!
//! Key modules:
//! - [`runner`]: `CommandRunner` seam over `tokio::process`
//! - [`discovery`]: control-plane container lookup
//! - [`workflow`]: the asynchronous provisioning state machine
//! - [`lifecycle`]: `LifecycleManager`, including the session cascade on delete
//! - [`testing`]: scripted command runner for tests

pub mod discovery;
pub mod lifecycle;
pub mod runner;
pub mod testing;
pub mod workflow;
