//! kindling daemon: wires the environment lifecycle, terminal bridge and
//! HTTP API together and serves them until shutdown.

pub mod daemon;
pub mod shutdown;
