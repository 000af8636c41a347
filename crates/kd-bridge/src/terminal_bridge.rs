//! Per-connection terminal handling.
//!
//! A [`TerminalConnection`] turns [`TerminalClientEvent`]s into session
//! operations and pushes [`TerminalServerEvent`]s onto an ordered channel.
//! It knows nothing about the transport; [`crate::terminal_ws`] is one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kd_core::config::TerminalConfig;
use kd_core::types::EnvironmentStatus;
use kd_provision::lifecycle::LifecycleManager;
use kd_session::pty::{PtyRequest, PtySpawner};
use kd_session::registry::{ConnectionId, SessionRegistry, TerminalSession};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::protocol::{TerminalClientEvent, TerminalServerEvent};

/// How long to wait for an exit status after the output stream ends.
const EXIT_STATUS_GRACE: Duration = Duration::from_millis(500);
const EXIT_STATUS_POLL: Duration = Duration::from_millis(25);

// ---------------------------------------------------------------------------
// TerminalBridge
// ---------------------------------------------------------------------------

/// Shared state behind every terminal connection.
pub struct TerminalBridge {
    lifecycle: Arc<LifecycleManager>,
    spawner: Arc<dyn PtySpawner>,
    terminal: TerminalConfig,
    docker: String,
}

impl TerminalBridge {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        spawner: Arc<dyn PtySpawner>,
        terminal: TerminalConfig,
        docker: impl Into<String>,
    ) -> Self {
        Self {
            lifecycle,
            spawner,
            terminal,
            docker: docker.into(),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        self.lifecycle.sessions()
    }

    /// Open a new connection with a fresh id and an empty event queue.
    pub fn connect(self: &Arc<Self>) -> TerminalConnection {
        let (events_tx, events_rx) = flume::unbounded();
        let connection = TerminalConnection {
            id: Uuid::new_v4(),
            bridge: self.clone(),
            events_tx,
            events_rx,
            closed: AtomicBool::new(false),
        };
        debug!(connection_id = %connection.id, "terminal connection opened");
        connection
    }

    /// `docker exec -it <container> <shell>` in the user's home directory.
    fn shell_request(&self, container_id: &str, cols: u16, rows: u16) -> PtyRequest {
        let mut request = PtyRequest::new(&self.docker)
            .args(["exec", "-it", container_id, self.terminal.shell.as_str()])
            .size(cols, rows)
            .env("TERM", &self.terminal.term);
        if let Some(home) = dirs::home_dir() {
            request = request.cwd(home);
        }
        request
    }
}

impl std::fmt::Debug for TerminalBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalBridge")
            .field("docker", &self.docker)
            .field("terminal", &self.terminal)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// TerminalConnection
// ---------------------------------------------------------------------------

/// One client connection. Holds at most one terminal session at a time.
///
/// Closing (or dropping) the connection unregisters and kills its session.
pub struct TerminalConnection {
    id: ConnectionId,
    bridge: Arc<TerminalBridge>,
    events_tx: flume::Sender<TerminalServerEvent>,
    events_rx: flume::Receiver<TerminalServerEvent>,
    closed: AtomicBool,
}

impl TerminalConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Outbound events in the order they were produced.
    pub fn events(&self) -> flume::Receiver<TerminalServerEvent> {
        self.events_rx.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn handle(&self, event: TerminalClientEvent) {
        if self.is_closed() {
            return;
        }
        match event {
            TerminalClientEvent::StartTerminal {
                environment_id,
                cols,
                rows,
            } => self.start(environment_id, cols, rows),
            TerminalClientEvent::TerminalInput { data } => self.input(data.as_bytes()),
            TerminalClientEvent::TerminalResize { cols, rows } => self.resize(cols, rows),
        }
    }

    /// Handle one JSON text frame. Malformed frames produce a `terminal-error`.
    pub fn handle_text(&self, text: &str) {
        match serde_json::from_str::<TerminalClientEvent>(text) {
            Ok(event) => self.handle(event),
            Err(e) => {
                debug!(connection_id = %self.id, "malformed terminal event: {e}");
                self.emit(TerminalServerEvent::error(format!(
                    "malformed terminal event: {e}"
                )));
            }
        }
    }

    /// Forward raw bytes to the session's process. Ignored without a session.
    pub fn input(&self, data: &[u8]) {
        let Some(session) = self.bridge.sessions().lookup(&self.id) else {
            debug!(connection_id = %self.id, "input without a session ignored");
            return;
        };
        if let Err(e) = session.write(data) {
            debug!(connection_id = %self.id, "terminal input dropped: {e}");
        }
    }

    fn resize(&self, cols: u16, rows: u16) {
        if cols == 0 || rows == 0 {
            debug!(connection_id = %self.id, cols, rows, "ignoring zero-sized resize");
            return;
        }
        let Some(session) = self.bridge.sessions().lookup(&self.id) else {
            return;
        };
        if let Err(e) = session.resize(cols, rows) {
            warn!(connection_id = %self.id, "terminal resize failed: {e}");
        }
    }

    fn start(&self, environment_id: Uuid, cols: Option<u16>, rows: Option<u16>) {
        let env = match self.bridge.lifecycle.get_environment(&environment_id) {
            Ok(env) => env,
            Err(_) => {
                self.reject(format!("environment {environment_id} not found"));
                return;
            }
        };
        let container_id = match (env.status, env.control_plane_container_id.as_deref()) {
            (EnvironmentStatus::Running, Some(container_id)) => container_id.to_string(),
            (EnvironmentStatus::Running, None) => {
                self.reject(format!(
                    "environment {environment_id} has no control-plane container"
                ));
                return;
            }
            (status, _) => {
                self.reject(format!(
                    "environment {environment_id} is {status}; terminals need a running environment"
                ));
                return;
            }
        };

        let terminal = &self.bridge.terminal;
        let cols = cols.filter(|c| *c > 0).unwrap_or(terminal.default_cols);
        let rows = rows.filter(|r| *r > 0).unwrap_or(terminal.default_rows);
        let request = self.bridge.shell_request(&container_id, cols, rows);
        let process = match self.bridge.spawner.spawn(&request) {
            Ok(process) => process,
            Err(e) => {
                self.reject(format!("could not start a shell in {container_id}: {e}"));
                return;
            }
        };

        let session = Arc::new(TerminalSession::new(
            self.id,
            environment_id,
            process,
            cols,
            rows,
        ));
        let output = session.output();
        let sessions = self.bridge.sessions().clone();
        if let Some(previous) = sessions.register(self.id, session.clone()) {
            info!(connection_id = %self.id, "replacing existing terminal session");
            previous.close();
        }
        if self.is_closed() {
            sessions.unregister_if_same(&self.id, &session);
            session.close();
            return;
        }
        // A delete that finished while the shell was spawning has already
        // swept the registry; one that starts after this check will sweep it.
        let still_running = self
            .bridge
            .lifecycle
            .get_environment(&environment_id)
            .is_ok_and(|env| env.status == EnvironmentStatus::Running);
        if !still_running {
            sessions.unregister_if_same(&self.id, &session);
            session.close();
            self.reject(format!(
                "environment {environment_id} is no longer running"
            ));
            return;
        }

        info!(connection_id = %self.id, %environment_id, %container_id, cols, rows, "terminal session started");
        self.emit(TerminalServerEvent::TerminalReady { environment_id });

        let span = info_span!("terminal", connection_id = %self.id, %environment_id);
        tokio::spawn(
            pump_output(self.id, session, output, self.events_tx.clone(), sessions).instrument(span),
        );
    }

    fn reject(&self, message: String) {
        warn!(connection_id = %self.id, %message, "terminal start rejected");
        self.emit(TerminalServerEvent::error(message));
    }

    fn emit(&self, event: TerminalServerEvent) {
        // The connection holds its own receiver, so this only fails after drop.
        let _ = self.events_tx.send(event);
    }

    /// Unregister and kill this connection's session. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(session) = self.bridge.sessions().unregister(&self.id) {
            session.close();
            info!(connection_id = %self.id, environment_id = %session.environment_id(), "terminal session closed with its connection");
        }
        debug!(connection_id = %self.id, "terminal connection closed");
    }
}

impl Drop for TerminalConnection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TerminalConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Output pump
// ---------------------------------------------------------------------------

/// Forward process output until the stream ends, then report the exit.
///
/// No `terminal-exit` is sent for a session that another `start-terminal`
/// on the same connection has already replaced.
async fn pump_output(
    connection_id: ConnectionId,
    session: Arc<TerminalSession>,
    output: flume::Receiver<Vec<u8>>,
    events: flume::Sender<TerminalServerEvent>,
    sessions: Arc<SessionRegistry>,
) {
    let mut text = Utf8Stream::default();
    while let Ok(chunk) = output.recv_async().await {
        let data = text.push(&chunk);
        if data.is_empty() {
            continue;
        }
        if events
            .send(TerminalServerEvent::TerminalOutput { data })
            .is_err()
        {
            break;
        }
    }
    let tail = text.finish();
    if !tail.is_empty() {
        let _ = events.send(TerminalServerEvent::TerminalOutput { data: tail });
    }

    let code = exit_status(&session).await;
    let superseded = sessions
        .lookup(&connection_id)
        .is_some_and(|current| !Arc::ptr_eq(&current, &session));
    sessions.unregister_if_same(&connection_id, &session);
    session.close();
    if !superseded {
        let _ = events.send(TerminalServerEvent::TerminalExit { code });
    }
    info!(code = ?code, superseded, "terminal session ended");
}

/// The exit status may trail the end of the output stream slightly.
async fn exit_status(session: &TerminalSession) -> Option<u32> {
    if session.is_closed() {
        return session.exit_code();
    }
    let deadline = tokio::time::Instant::now() + EXIT_STATUS_GRACE;
    loop {
        if let Some(code) = session.exit_code() {
            return Some(code);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(EXIT_STATUS_POLL).await;
    }
}

/// Decodes a byte stream into text without splitting multi-byte characters
/// across chunk boundaries. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
struct Utf8Stream {
    pending: Vec<u8>,
}

impl Utf8Stream {
    fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(valid) => {
                    out.push_str(valid);
                    self.pending.clear();
                    return out;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end; wait for more bytes.
                            self.pending.drain(..valid);
                            return out;
                        }
                    }
                }
            }
        }
    }

    fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
