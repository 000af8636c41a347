use std::collections::HashSet;
use std::io::{Read as IoRead, Write as IoWrite};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("pty pool is at capacity ({max})")]
    AtCapacity { max: usize },

    #[error("pty spawn failed: {0}")]
    SpawnFailed(String),

    #[error("pty I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pty internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PtyError>;

// ---------------------------------------------------------------------------
// PtyRequest
// ---------------------------------------------------------------------------

/// Everything needed to start a process inside a fresh PTY.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

impl PtyRequest {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cols: 80,
            rows: 24,
            cwd: None,
            env: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.cols = cols;
        self.rows = rows;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// A running process attached to a pseudo-terminal.
///
/// Output arrives on the channel returned by [`PtyProcess::output`] in the
/// order the process wrote it. The channel disconnects once the process has
/// exited and all of its output has been delivered.
pub trait PtyProcess: Send + Sync {
    fn id(&self) -> Uuid;

    /// Queue bytes for the process's stdin. Writes are applied in call order.
    fn write(&self, data: &[u8]) -> Result<()>;

    fn resize(&self, cols: u16, rows: u16) -> Result<()>;

    fn output(&self) -> flume::Receiver<Vec<u8>>;

    /// Exit code once the process has finished.
    fn exit_code(&self) -> Option<u32>;

    fn is_alive(&self) -> bool;

    fn kill(&self) -> Result<()>;
}

/// Starts processes inside PTYs.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, request: &PtyRequest) -> Result<Box<dyn PtyProcess>>;
}

// ---------------------------------------------------------------------------
// PtyHandle
// ---------------------------------------------------------------------------

fn lock_recover<'a, T: ?Sized>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| {
        warn!("{what} lock was poisoned, recovering");
        e.into_inner()
    })
}

/// A native PTY with async read/write channels.
///
/// Dropping the handle kills the child if it is still running and frees
/// its slot in the owning [`PtyPool`].
pub struct PtyHandle {
    id: Uuid,
    reader: flume::Receiver<Vec<u8>>,
    writer: flume::Sender<Vec<u8>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    master: Arc<Mutex<Box<dyn portable_pty::MasterPty + Send>>>,
    slots: Arc<Mutex<HashSet<Uuid>>>,
    _reader_thread: Option<std::thread::JoinHandle<()>>,
    _writer_thread: Option<std::thread::JoinHandle<()>>,
}

impl PtyProcess for PtyHandle {
    fn id(&self) -> Uuid {
        self.id
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        self.writer
            .send(data.to_vec())
            .map_err(|e| PtyError::Internal(format!("writer channel closed: {e}")))?;
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        let master = lock_recover(&self.master, "master");
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::Internal(format!("resize failed: {e}")))?;
        debug!(id = %self.id, cols, rows, "PTY resized");
        Ok(())
    }

    fn output(&self) -> flume::Receiver<Vec<u8>> {
        self.reader.clone()
    }

    fn exit_code(&self) -> Option<u32> {
        let mut child = lock_recover(&self.child, "child");
        match child.try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }

    fn is_alive(&self) -> bool {
        let mut child = lock_recover(&self.child, "child");
        matches!(child.try_wait(), Ok(None))
    }

    fn kill(&self) -> Result<()> {
        let mut child = lock_recover(&self.child, "child");
        child
            .kill()
            .map_err(|e| PtyError::Internal(e.to_string()))?;
        debug!(id = %self.id, "PTY child killed");
        Ok(())
    }
}

impl Drop for PtyHandle {
    fn drop(&mut self) {
        if self.is_alive() {
            if let Err(e) = self.kill() {
                warn!(id = %self.id, "failed to kill PTY child on drop: {e}");
            }
        }
        lock_recover(&self.slots, "PtyPool").remove(&self.id);
        debug!(id = %self.id, "released PTY handle from pool");
    }
}

impl std::fmt::Debug for PtyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PtyPool
// ---------------------------------------------------------------------------

/// Spawns native PTYs up to a configured number of concurrent processes.
pub struct PtyPool {
    max_ptys: usize,
    slots: Arc<Mutex<HashSet<Uuid>>>,
}

impl PtyPool {
    /// Create a new pool with the given maximum number of concurrent PTYs.
    pub fn new(max_ptys: usize) -> Self {
        info!(max_ptys, "creating PtyPool");
        Self {
            max_ptys,
            slots: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Number of live handles spawned by this pool.
    pub fn active_count(&self) -> usize {
        lock_recover(&self.slots, "PtyPool").len()
    }

    pub fn max_ptys(&self) -> usize {
        self.max_ptys
    }

    /// Spawn `request.program` inside a PTY of the requested size.
    pub fn spawn_handle(&self, request: &PtyRequest) -> Result<PtyHandle> {
        {
            let slots = lock_recover(&self.slots, "PtyPool");
            if slots.len() >= self.max_ptys {
                return Err(PtyError::AtCapacity { max: self.max_ptys });
            }
        }

        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: request.rows,
                cols: request.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let mut command = CommandBuilder::new(&request.program);
        for arg in &request.args {
            command.arg(arg);
        }
        for (k, v) in &request.env {
            command.env(k, v);
        }
        if let Some(cwd) = &request.cwd {
            command.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        // The child holds its own copy of the slave; ours must go so the
        // reader sees EOF when the child exits.
        drop(pair.slave);

        debug!(program = %request.program, args = ?request.args, "spawned PTY process");

        let handle_id = Uuid::new_v4();

        // -- stdout reader thread --
        let (read_tx, read_rx) = flume::bounded::<Vec<u8>>(256);
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let reader_thread = std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if read_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // EIO is expected once the child exits.
                        if e.kind() != std::io::ErrorKind::Other {
                            debug!("pty reader error: {e}");
                        }
                        break;
                    }
                }
            }
        });

        // -- stdin writer thread --
        let (write_tx, write_rx) = flume::bounded::<Vec<u8>>(256);
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;
        let writer_thread = std::thread::spawn(move || {
            while let Ok(data) = write_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        lock_recover(&self.slots, "PtyPool").insert(handle_id);

        Ok(PtyHandle {
            id: handle_id,
            reader: read_rx,
            writer: write_tx,
            child: Arc::new(Mutex::new(child)),
            master: Arc::new(Mutex::new(pair.master)),
            slots: self.slots.clone(),
            _reader_thread: Some(reader_thread),
            _writer_thread: Some(writer_thread),
        })
    }
}

impl PtySpawner for PtyPool {
    fn spawn(&self, request: &PtyRequest) -> Result<Box<dyn PtyProcess>> {
        let handle = self.spawn_handle(request)?;
        Ok(Box::new(handle))
    }
}

impl std::fmt::Debug for PtyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyPool")
            .field("max_ptys", &self.max_ptys)
            .field("active_count", &self.active_count())
            .finish()
    }
}
