use std::io::Write as IoWrite;
use std::sync::Arc;

use kd_core::cluster_config::{ClusterConfigBuilder, ClusterOptions};
use kd_core::config::ToolsConfig;
use kd_core::error::{LifecycleError, Result};
use kd_core::store::EnvironmentStore;
use kd_core::types::{Environment, EnvironmentStatus};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::discovery::{find_container_id, DiscoveryError};
use crate::runner::{CommandRunner, RunnerError};

/// One external command in a fixed sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandStep {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandStep {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Why a provisioning step failed. The display text becomes the record's
/// `error` (or `mesh_error`) field.
#[derive(Debug, Error)]
pub enum ProvisionStepError {
    #[error("could not create config document in {dir}: {source}")]
    ConfigCreate {
        dir: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not write config document: {0}")]
    ConfigWrite(#[source] std::io::Error),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// A tool ran but exited unsuccessfully.
    #[error("{0}")]
    CommandFailed(String),

    #[error("control-plane container {0} not found")]
    ContainerNotFound(String),

    #[error("control-plane container lookup failed: {0}")]
    Discovery(#[source] DiscoveryError),
}

type StepResult<T> = std::result::Result<T, ProvisionStepError>;

// ---------------------------------------------------------------------------
// ProvisioningWorkflow
// ---------------------------------------------------------------------------

/// Brings one environment from `creating` to `running` or `error`.
///
/// The workflow only ever holds an environment id. Every status change is
/// written back through the store's atomic update.
pub struct ProvisioningWorkflow {
    store: Arc<EnvironmentStore>,
    runner: Arc<dyn CommandRunner>,
    config_builder: Arc<dyn ClusterConfigBuilder>,
    tools: ToolsConfig,
}

impl ProvisioningWorkflow {
    pub fn new(
        store: Arc<EnvironmentStore>,
        runner: Arc<dyn CommandRunner>,
        config_builder: Arc<dyn ClusterConfigBuilder>,
        tools: ToolsConfig,
    ) -> Self {
        Self {
            store,
            runner,
            config_builder,
            tools,
        }
    }

    pub fn store(&self) -> &Arc<EnvironmentStore> {
        &self.store
    }

    /// Run every provisioning step for `id`.
    ///
    /// Failures are recorded on the environment record, never returned.
    pub async fn provision(&self, id: Uuid) {
        let Some(env) = self.store.get(&id) else {
            warn!(%id, "environment vanished before provisioning started");
            return;
        };
        if env.status != EnvironmentStatus::Creating {
            warn!(%id, status = %env.status, "refusing to provision environment outside creating");
            return;
        }
        info!(%id, name = %env.name, node_count = env.node_count, "provisioning started");

        let container_id = match self.create_cluster(&env).await {
            Ok(container_id) => container_id,
            Err(e) => {
                self.mark_failed(&id, e.to_string());
                return;
            }
        };

        let mesh_error = if env.install_mesh {
            self.install_mesh(&env).await.err().map(|e| e.to_string())
        } else {
            None
        };

        match self
            .store
            .transition_with(&id, EnvironmentStatus::Running, |record| {
                record.control_plane_container_id = Some(container_id);
                record.mesh_error = mesh_error;
            }) {
            Ok(env) => info!(
                %id,
                container_id = env.control_plane_container_id.as_deref().unwrap_or_default(),
                "environment running"
            ),
            Err(e) => error!(%id, "failed to mark environment running: {e}"),
        }
    }

    /// Write the config document, create the cluster, locate the
    /// control-plane container. The config file is removed on every path.
    async fn create_cluster(&self, env: &Environment) -> StepResult<String> {
        let config_file = self.write_config(env)?;
        let created = self.run_create(env, &config_file).await;
        let path = config_file.path().display().to_string();
        match config_file.close() {
            Ok(()) => debug!(id = %env.id, path, "removed cluster config document"),
            Err(e) => warn!(id = %env.id, path, "could not remove cluster config document: {e}"),
        }
        created?;

        match find_container_id(
            self.runner.as_ref(),
            &self.tools.docker,
            &env.control_plane_container_name(),
        )
        .await
        {
            Ok(Some(container_id)) => {
                debug!(id = %env.id, %container_id, "control-plane container located");
                Ok(container_id)
            }
            Ok(None) => Err(ProvisionStepError::ContainerNotFound(
                env.control_plane_container_name(),
            )),
            Err(e) => Err(ProvisionStepError::Discovery(e)),
        }
    }

    fn write_config(&self, env: &Environment) -> StepResult<NamedTempFile> {
        let options = ClusterOptions {
            kubernetes_version: env.kubernetes_version,
        };
        let document = self.config_builder.build(env.node_count, &options);

        let dir = self.tools.config_dir();
        let mut file = tempfile::Builder::new()
            .prefix(&format!("kind-config-{}-", env.id))
            .suffix(self.config_builder.file_suffix())
            .tempfile_in(&dir)
            .map_err(|source| ProvisionStepError::ConfigCreate {
                dir: dir.display().to_string(),
                source,
            })?;
        file.write_all(document.as_bytes())
            .and_then(|()| file.flush())
            .map_err(ProvisionStepError::ConfigWrite)?;
        debug!(id = %env.id, path = %file.path().display(), "wrote cluster config document");
        Ok(file)
    }

    async fn run_create(
        &self,
        env: &Environment,
        config_file: &NamedTempFile,
    ) -> StepResult<()> {
        let args = vec![
            "create".to_string(),
            "cluster".to_string(),
            "--name".to_string(),
            env.name.clone(),
            "--config".to_string(),
            config_file.path().display().to_string(),
        ];
        let output = self.runner.run(&self.tools.kind, &args).await?;
        if output.success() {
            info!(id = %env.id, name = %env.name, "kind cluster created");
            Ok(())
        } else {
            Err(ProvisionStepError::CommandFailed(
                output.describe_failure(&self.tools.kind),
            ))
        }
    }

    /// The fixed mesh install sequence for `env`.
    pub fn mesh_plan(&self, env: &Environment) -> Vec<CommandStep> {
        let context = env.kube_context();
        vec![
            CommandStep::new(
                &self.tools.istioctl,
                &[
                    "install",
                    "--set",
                    &format!("profile={}", self.tools.mesh_profile),
                    "-y",
                    "--context",
                    &context,
                ],
            ),
            CommandStep::new(
                &self.tools.kubectl,
                &[
                    "--context",
                    &context,
                    "label",
                    "namespace",
                    "default",
                    "istio-injection=enabled",
                    "--overwrite",
                ],
            ),
        ]
    }

    /// Best-effort mesh install: stops at the first failing command and
    /// returns its reason. The caller keeps the environment running.
    async fn install_mesh(&self, env: &Environment) -> StepResult<()> {
        for step in self.mesh_plan(env) {
            let outcome = match self.runner.run(&step.program, &step.args).await {
                Ok(output) if output.success() => Ok(()),
                Ok(output) => Err(ProvisionStepError::CommandFailed(
                    output.describe_failure(&step.program),
                )),
                Err(e) => Err(ProvisionStepError::Runner(e)),
            };
            if let Err(reason) = outcome {
                warn!(
                    id = %env.id,
                    program = %step.program,
                    %reason,
                    "mesh install failed; environment will still be marked running"
                );
                return Err(reason);
            }
        }
        info!(id = %env.id, "service mesh installed");
        Ok(())
    }

    fn mark_failed(&self, id: &Uuid, reason: String) {
        warn!(%id, %reason, "provisioning failed");
        if let Err(e) = self
            .store
            .transition_with(id, EnvironmentStatus::Error, |record| {
                record.error = Some(reason);
            })
        {
            error!(%id, "failed to mark environment as error: {e}");
        }
    }

    /// Delete the external cluster backing `env`.
    pub async fn teardown(&self, env: &Environment) -> Result<()> {
        let args = vec![
            "delete".to_string(),
            "cluster".to_string(),
            "--name".to_string(),
            env.name.clone(),
        ];
        let output = self
            .runner
            .run(&self.tools.kind, &args)
            .await
            .map_err(|e| LifecycleError::Provisioning(e.to_string()))?;
        if output.success() {
            info!(id = %env.id, name = %env.name, "kind cluster deleted");
            Ok(())
        } else {
            Err(LifecycleError::Provisioning(
                output.describe_failure(&self.tools.kind),
            ))
        }
    }
}

impl std::fmt::Debug for ProvisioningWorkflow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisioningWorkflow")
            .field("tools", &self.tools)
            .finish()
    }
}
