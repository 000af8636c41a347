//! Pseudo-terminal sessions for kindling.
//!
//! Interactive shells inside a cluster's control-plane container run in a
//! PTY owned by exactly one [`registry::TerminalSession`], which in turn is
//! owned by one client connection.
//!
//! Key components:
//! - [`pty`]: the `PtyProcess`/`PtySpawner` seam and the native PTY pool
//! - [`registry`]: concurrent connection-to-session map with the
//!   environment-deletion cascade
//! - [`testing`]: in-memory PTY double that records writes, resizes and kills

pub mod pty;
pub mod registry;
pub mod testing;
