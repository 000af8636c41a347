//! In-memory PTY double.
//!
//! [`FakePtySpawner`] hands out processes that never touch the OS. Tests
//! drive their output and exit, and inspect what was written, resized and
//! killed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use uuid::Uuid;

use crate::pty::{PtyError, PtyProcess, PtyRequest, PtySpawner, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ---------------------------------------------------------------------------
// FakePtyState
// ---------------------------------------------------------------------------

/// Observable state of one fake process.
pub struct FakePtyState {
    id: Uuid,
    request: PtyRequest,
    writes: Mutex<Vec<Vec<u8>>>,
    resizes: Mutex<Vec<(u16, u16)>>,
    kills: AtomicUsize,
    exit_code: Mutex<Option<u32>>,
    out_tx: Mutex<Option<flume::Sender<Vec<u8>>>>,
    out_rx: flume::Receiver<Vec<u8>>,
}

impl FakePtyState {
    fn new(request: PtyRequest) -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            id: Uuid::new_v4(),
            request,
            writes: Mutex::new(Vec::new()),
            resizes: Mutex::new(Vec::new()),
            kills: AtomicUsize::new(0),
            exit_code: Mutex::new(None),
            out_tx: Mutex::new(Some(tx)),
            out_rx: rx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The request this process was spawned with.
    pub fn request(&self) -> &PtyRequest {
        &self.request
    }

    /// Everything written so far, concatenated in order.
    pub fn input(&self) -> Vec<u8> {
        lock(&self.writes).concat()
    }

    /// Individual write calls in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.writes).clone()
    }

    pub fn resizes(&self) -> Vec<(u16, u16)> {
        lock(&self.resizes).clone()
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn is_alive(&self) -> bool {
        lock(&self.out_tx).is_some()
    }

    /// Produce output as if the process wrote it. Returns `false` once exited.
    pub fn emit(&self, data: &[u8]) -> bool {
        match lock(&self.out_tx).as_ref() {
            Some(tx) => tx.send(data.to_vec()).is_ok(),
            None => false,
        }
    }

    /// Exit with `code`, ending the output stream.
    pub fn exit(&self, code: u32) {
        *lock(&self.exit_code) = Some(code);
        lock(&self.out_tx).take();
    }
}

// ---------------------------------------------------------------------------
// FakePty
// ---------------------------------------------------------------------------

struct FakePty(Arc<FakePtyState>);

impl PtyProcess for FakePty {
    fn id(&self) -> Uuid {
        self.0.id
    }

    fn write(&self, data: &[u8]) -> Result<()> {
        if !self.0.is_alive() {
            return Err(PtyError::Internal("process has exited".into()));
        }
        lock(&self.0.writes).push(data.to_vec());
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        lock(&self.0.resizes).push((cols, rows));
        Ok(())
    }

    fn output(&self) -> flume::Receiver<Vec<u8>> {
        self.0.out_rx.clone()
    }

    fn exit_code(&self) -> Option<u32> {
        *lock(&self.0.exit_code)
    }

    fn is_alive(&self) -> bool {
        self.0.is_alive()
    }

    fn kill(&self) -> Result<()> {
        self.0.kills.fetch_add(1, Ordering::SeqCst);
        lock(&self.0.out_tx).take();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakePtySpawner
// ---------------------------------------------------------------------------

/// Spawner that records every fake process it creates.
#[derive(Default)]
pub struct FakePtySpawner {
    processes: Mutex<Vec<Arc<FakePtyState>>>,
    fail_next: Mutex<Option<String>>,
}

impl FakePtySpawner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `spawn` call fail with `PtyError::SpawnFailed(reason)`.
    pub fn fail_next_spawn(&self, reason: impl Into<String>) {
        *lock(&self.fail_next) = Some(reason.into());
    }

    /// Every process spawned so far, oldest first.
    pub fn processes(&self) -> Vec<Arc<FakePtyState>> {
        lock(&self.processes).clone()
    }

    pub fn last(&self) -> Option<Arc<FakePtyState>> {
        lock(&self.processes).last().cloned()
    }

    pub fn spawn_count(&self) -> usize {
        lock(&self.processes).len()
    }
}

impl PtySpawner for FakePtySpawner {
    fn spawn(&self, request: &PtyRequest) -> Result<Box<dyn PtyProcess>> {
        if let Some(reason) = lock(&self.fail_next).take() {
            return Err(PtyError::SpawnFailed(reason));
        }
        let state = Arc::new(FakePtyState::new(request.clone()));
        lock(&self.processes).push(state.clone());
        Ok(Box::new(FakePty(state)))
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
