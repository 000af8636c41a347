use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pty::{PtyProcess, Result};

/// Identifier of one client connection.
pub type ConnectionId = Uuid;

// ---------------------------------------------------------------------------
// TerminalSession
// ---------------------------------------------------------------------------

/// One interactive shell bound to one connection and one environment.
///
/// The session exclusively owns its PTY process. [`TerminalSession::close`]
/// kills the process at most once; dropping the session closes it.
pub struct TerminalSession {
    connection_id: ConnectionId,
    environment_id: Uuid,
    process: Box<dyn PtyProcess>,
    started_at: DateTime<Utc>,
    geometry: Mutex<(u16, u16)>,
    closed: AtomicBool,
}

impl TerminalSession {
    pub fn new(
        connection_id: ConnectionId,
        environment_id: Uuid,
        process: Box<dyn PtyProcess>,
        cols: u16,
        rows: u16,
    ) -> Self {
        Self {
            connection_id,
            environment_id,
            process,
            started_at: Utc::now(),
            geometry: Mutex::new((cols, rows)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn environment_id(&self) -> Uuid {
        self.environment_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn process_id(&self) -> Uuid {
        self.process.id()
    }

    /// Current `(cols, rows)`.
    pub fn geometry(&self) -> (u16, u16) {
        *self.geometry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.process.write(data)
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.process.resize(cols, rows)?;
        *self.geometry.lock().unwrap_or_else(|e| e.into_inner()) = (cols, rows);
        Ok(())
    }

    pub fn output(&self) -> flume::Receiver<Vec<u8>> {
        self.process.output()
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.process.exit_code()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the process handle, killing it if it is still running.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.process.is_alive() {
            match self.process.kill() {
                Ok(()) => info!(
                    connection_id = %self.connection_id,
                    environment_id = %self.environment_id,
                    "terminal session process killed"
                ),
                Err(e) => warn!(
                    connection_id = %self.connection_id,
                    "failed to kill terminal session process: {e}"
                ),
            }
        } else {
            debug!(connection_id = %self.connection_id, "terminal session closed after exit");
        }
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalSession")
            .field("connection_id", &self.connection_id)
            .field("environment_id", &self.environment_id)
            .field("process_id", &self.process.id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// SessionRegistry
// ---------------------------------------------------------------------------

/// Concurrent map from connection id to its active terminal session.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Arc<TerminalSession>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` for `connection_id`, returning any session it displaced.
    ///
    /// The displaced session is *not* closed here; the caller decides.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        session: Arc<TerminalSession>,
    ) -> Option<Arc<TerminalSession>> {
        debug!(%connection_id, environment_id = %session.environment_id(), "registering terminal session");
        self.sessions.insert(connection_id, session)
    }

    pub fn lookup(&self, connection_id: &ConnectionId) -> Option<Arc<TerminalSession>> {
        self.sessions.get(connection_id).map(|s| s.value().clone())
    }

    pub fn unregister(&self, connection_id: &ConnectionId) -> Option<Arc<TerminalSession>> {
        self.sessions.remove(connection_id).map(|(_, s)| s)
    }

    /// Unregister only if `session` is still the one registered for the connection.
    pub fn unregister_if_same(
        &self,
        connection_id: &ConnectionId,
        session: &Arc<TerminalSession>,
    ) -> bool {
        self.sessions
            .remove_if(connection_id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn all_for_environment(&self, environment_id: &Uuid) -> Vec<Arc<TerminalSession>> {
        self.sessions
            .iter()
            .filter(|entry| entry.value().environment_id() == *environment_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Unregister and close every session attached to `environment_id`.
    pub fn close_for_environment(&self, environment_id: &Uuid) -> usize {
        let mut closed = 0;
        for session in self.all_for_environment(environment_id) {
            let removed = self
                .sessions
                .remove_if(&session.connection_id(), |_, current| {
                    Arc::ptr_eq(current, &session)
                })
                .is_some();
            session.close();
            if removed {
                closed += 1;
            }
        }
        if closed > 0 {
            info!(%environment_id, closed, "closed terminal sessions for environment");
        }
        closed
    }

    /// Unregister and close every session.
    pub fn close_all(&self) -> usize {
        let ids: Vec<ConnectionId> = self.sessions.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some(session) = self.unregister(&id) {
                session.close();
                closed += 1;
            }
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("len", &self.len())
            .finish()
    }
}
