use std::sync::Arc;

use kd_core::error::{LifecycleError, Result};
use kd_core::store::EnvironmentStore;
use kd_core::types::{Environment, EnvironmentSpec, EnvironmentStatus};
use kd_session::registry::SessionRegistry;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::workflow::ProvisioningWorkflow;

/// The create / list / get / delete surface over the environment store.
///
/// Creation returns as soon as the record exists; provisioning continues on
/// a background task. Deletion tears the cluster down synchronously and then
/// closes every terminal session attached to the environment.
pub struct LifecycleManager {
    workflow: Arc<ProvisioningWorkflow>,
    sessions: Arc<SessionRegistry>,
}

impl LifecycleManager {
    pub fn new(workflow: Arc<ProvisioningWorkflow>, sessions: Arc<SessionRegistry>) -> Self {
        Self { workflow, sessions }
    }

    pub fn store(&self) -> &Arc<EnvironmentStore> {
        self.workflow.store()
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn list_environments(&self) -> Vec<Environment> {
        self.store().list()
    }

    pub fn get_environment(&self, id: &Uuid) -> Result<Environment> {
        self.store().get(id).ok_or(LifecycleError::NotFound(*id))
    }

    /// Validate `spec`, insert a `creating` record and start provisioning.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn create_environment(&self, spec: &EnvironmentSpec) -> Result<Environment> {
        let env = self.store().create(spec)?;
        info!(id = %env.id, name = %env.name, "environment accepted; provisioning in background");

        let workflow = self.workflow.clone();
        let id = env.id;
        let span = info_span!("provision", %id, name = %env.name);
        tokio::spawn(async move { workflow.provision(id).await }.instrument(span));

        Ok(env)
    }

    /// Tear down the cluster behind `id` and drop its record.
    ///
    /// Only `running` and `error` environments can be deleted. When teardown
    /// fails the record returns to its previous status and the failure is
    /// surfaced to the caller.
    ///
    /// Teardown and its bookkeeping run on their own task: once the record is
    /// `deleting`, it always reaches either removal or rollback, even if the
    /// caller stops waiting.
    pub async fn delete_environment(&self, id: &Uuid) -> Result<Environment> {
        let mut previous = None;
        let env = self.store().try_update(id, |env| {
            if !env.status.can_transition_to(&EnvironmentStatus::Deleting) {
                return Err(LifecycleError::Conflict(format!(
                    "environment {} is {} and cannot be deleted now",
                    env.id, env.status
                )));
            }
            previous = Some(env.status);
            env.status = EnvironmentStatus::Deleting;
            Ok(())
        })?;
        let previous = previous.unwrap_or(EnvironmentStatus::Error);
        info!(%id, name = %env.name, from = %previous, "deleting environment");

        let workflow = self.workflow.clone();
        let sessions = self.sessions.clone();
        let span = info_span!("delete", %id, name = %env.name);
        let task =
            tokio::spawn(finish_delete(workflow, sessions, env, previous).instrument(span));
        task.await
            .map_err(|e| LifecycleError::Provisioning(format!("delete task failed: {e}")))?
    }

    /// Close every terminal session. Called once when the daemon stops.
    pub fn shutdown(&self) {
        let closed = self.sessions.close_all();
        info!(closed_sessions = closed, "lifecycle manager shut down");
    }
}

/// Tear down `env` (already `deleting`), then remove its record and close
/// its sessions, or restore `previous` on failure.
async fn finish_delete(
    workflow: Arc<ProvisioningWorkflow>,
    sessions: Arc<SessionRegistry>,
    env: Environment,
    previous: EnvironmentStatus,
) -> Result<Environment> {
    let id = env.id;
    let store = workflow.store();
    if let Err(e) = workflow.teardown(&env).await {
        warn!(%id, error = %e, "teardown failed; restoring previous status");
        if let Err(rollback) = store.transition(&id, previous) {
            warn!(%id, "could not restore environment status: {rollback}");
        }
        return Err(e);
    }

    let removed = store.delete(&id).unwrap_or(env);
    let closed = sessions.close_for_environment(&id);
    info!(%id, closed_sessions = closed, "environment deleted");
    Ok(removed)
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("environments", &self.store().len())
            .field("sessions", &self.sessions.len())
            .finish()
    }
}
