use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use kd_bridge::http_api::{api_router, ApiState};
use kd_bridge::terminal_bridge::TerminalBridge;
use kd_core::cluster_config::KindConfigBuilder;
use kd_core::config::Config;
use kd_core::store::EnvironmentStore;
use kd_provision::lifecycle::LifecycleManager;
use kd_provision::runner::{CommandRunner, TokioCommandRunner};
use kd_provision::workflow::ProvisioningWorkflow;
use kd_session::pty::{PtyPool, PtySpawner};
use kd_session::registry::SessionRegistry;
use tracing::info;

use crate::shutdown::ShutdownSignal;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "KINDLING_CONFIG";

/// Load configuration from `explicit` when given, otherwise from the default
/// location (falling back to defaults when that file is absent).
pub fn load_config(explicit: Option<PathBuf>) -> Result<Config> {
    match explicit {
        Some(path) => Config::load_from(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Config::load().context("failed to load config"),
    }
}

/// Composition root: owns every long-lived component of the service.
pub struct Daemon {
    config: Config,
    lifecycle: Arc<LifecycleManager>,
    api_state: Arc<ApiState>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Build a daemon that drives the real tools and native PTYs.
    pub fn new(config: Config) -> Self {
        let spawner = Arc::new(PtyPool::new(config.terminal.max_sessions));
        Self::with_components(config, Arc::new(TokioCommandRunner), spawner)
    }

    /// Build a daemon around the given command runner and PTY spawner.
    pub fn with_components(
        config: Config,
        runner: Arc<dyn CommandRunner>,
        spawner: Arc<dyn PtySpawner>,
    ) -> Self {
        let store = Arc::new(EnvironmentStore::new(config.environments.policy));
        let workflow = Arc::new(ProvisioningWorkflow::new(
            store,
            runner,
            Arc::new(KindConfigBuilder),
            config.tools.clone(),
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            workflow,
            Arc::new(SessionRegistry::new()),
        ));
        let bridge = Arc::new(TerminalBridge::new(
            lifecycle.clone(),
            spawner,
            config.terminal.clone(),
            config.tools.docker.clone(),
        ));
        let api_state = Arc::new(ApiState::new(lifecycle.clone(), bridge));
        Self {
            config,
            lifecycle,
            api_state,
            shutdown: ShutdownSignal::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn api_state(&self) -> &Arc<ApiState> {
        &self.api_state
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    pub fn router(&self) -> Router {
        api_router(self.api_state.clone())
    }

    /// Serve on a pre-bound listener until shutdown is triggered, then close
    /// every terminal session.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let bind_addr = listener.local_addr()?;
        info!(%bind_addr, policy = ?self.config.environments.policy, "API server listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
            .context("API server failed")?;

        self.lifecycle.shutdown();
        info!("daemon stopped");
        Ok(())
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let bind_addr = self.config.daemon.bind_addr();
        let listener = tokio::net::TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        self.run_with_listener(listener).await
    }
}
