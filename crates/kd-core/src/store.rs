use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{LifecycleError, Result};
use crate::types::{
    Environment, EnvironmentSpec, EnvironmentStatus, KubernetesVersion, MAX_NODE_COUNT,
    MIN_NODE_COUNT,
};

// ---------------------------------------------------------------------------
// InstancePolicy
// ---------------------------------------------------------------------------

/// How many environments may coexist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstancePolicy {
    /// Identifiers are unique and independently lifecycled.
    #[default]
    Multi,
    /// At most one record exists at a time, whatever its status.
    Single,
}

// ---------------------------------------------------------------------------
// EnvironmentStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    order: Vec<Uuid>,
    records: HashMap<Uuid, Environment>,
}

/// In-memory authoritative registry of environment records.
///
/// Every read hands out a clone; every write goes through the single lock,
/// so a read-modify-write via [`EnvironmentStore::update`] cannot lose an
/// update to a concurrent writer.
pub struct EnvironmentStore {
    policy: InstancePolicy,
    inner: RwLock<StoreInner>,
}

impl EnvironmentStore {
    pub fn new(policy: InstancePolicy) -> Self {
        info!(?policy, "creating EnvironmentStore");
        Self {
            policy,
            inner: RwLock::new(StoreInner::default()),
        }
    }

    pub fn policy(&self) -> InstancePolicy {
        self.policy
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|e| {
            warn!("EnvironmentStore lock was poisoned, recovering");
            e.into_inner()
        })
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|e| {
            warn!("EnvironmentStore lock was poisoned, recovering");
            e.into_inner()
        })
    }

    /// Validate `spec` and insert a new record in `Creating`.
    pub fn create(&self, spec: &EnvironmentSpec) -> Result<Environment> {
        let (node_count, kubernetes_version) = validate_spec(spec)?;

        let mut inner = self.write();
        if self.policy == InstancePolicy::Single {
            if let Some(existing) = inner.order.first() {
                return Err(LifecycleError::Conflict(format!(
                    "environment {existing} already exists; delete it before creating a new one"
                )));
            }
        }

        let id = Uuid::new_v4();
        let env = Environment {
            id,
            name: Environment::name_for(&id),
            node_count,
            kubernetes_version,
            install_mesh: spec.install_mesh,
            status: EnvironmentStatus::Creating,
            control_plane_container_id: None,
            created_at: Utc::now(),
            error: None,
            mesh_error: None,
        };
        inner.order.push(id);
        inner.records.insert(id, env.clone());
        info!(%id, name = %env.name, node_count, "environment record created");
        Ok(env)
    }

    pub fn get(&self, id: &Uuid) -> Option<Environment> {
        self.read().records.get(id).cloned()
    }

    /// All records in insertion order.
    pub fn list(&self) -> Vec<Environment> {
        let inner = self.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically apply `mutation` to the record and return the result.
    ///
    /// The mutation may reject the change by returning an error, in which
    /// case the record is left untouched.
    pub fn try_update<F>(&self, id: &Uuid, mutation: F) -> Result<Environment>
    where
        F: FnOnce(&mut Environment) -> Result<()>,
    {
        let mut inner = self.write();
        let record = inner
            .records
            .get_mut(id)
            .ok_or(LifecycleError::NotFound(*id))?;
        let mut draft = record.clone();
        mutation(&mut draft)?;
        // Identity fields never change after creation.
        draft.id = record.id;
        draft.name = record.name.clone();
        draft.node_count = record.node_count;
        draft.kubernetes_version = record.kubernetes_version;
        draft.install_mesh = record.install_mesh;
        draft.created_at = record.created_at;
        *record = draft.clone();
        Ok(draft)
    }

    /// Atomically apply an infallible `mutation`.
    pub fn update<F>(&self, id: &Uuid, mutation: F) -> Result<Environment>
    where
        F: FnOnce(&mut Environment),
    {
        self.try_update(id, |env| {
            mutation(env);
            Ok(())
        })
    }

    /// Move the record to `to`, enforcing the status state machine.
    pub fn transition(&self, id: &Uuid, to: EnvironmentStatus) -> Result<Environment> {
        self.transition_with(id, to, |_| {})
    }

    /// Move the record to `to` and apply `mutation` in the same atomic step.
    pub fn transition_with<F>(
        &self,
        id: &Uuid,
        to: EnvironmentStatus,
        mutation: F,
    ) -> Result<Environment>
    where
        F: FnOnce(&mut Environment),
    {
        let env = self.try_update(id, |env| {
            if !env.status.can_transition_to(&to) {
                return Err(LifecycleError::InvalidTransition {
                    from: env.status,
                    to,
                });
            }
            env.status = to;
            mutation(env);
            Ok(())
        })?;
        debug!(%id, to = %to, "environment status transition");
        Ok(env)
    }

    /// Remove the record, returning it if it existed.
    pub fn delete(&self, id: &Uuid) -> Option<Environment> {
        let mut inner = self.write();
        let removed = inner.records.remove(id);
        if removed.is_some() {
            inner.order.retain(|existing| existing != id);
            info!(%id, "environment record removed");
        }
        removed
    }
}

impl Default for EnvironmentStore {
    fn default() -> Self {
        Self::new(InstancePolicy::default())
    }
}

impl std::fmt::Debug for EnvironmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentStore")
            .field("policy", &self.policy)
            .field("len", &self.len())
            .finish()
    }
}

fn validate_spec(spec: &EnvironmentSpec) -> Result<(u8, Option<KubernetesVersion>)> {
    let range = i64::from(MIN_NODE_COUNT)..=i64::from(MAX_NODE_COUNT);
    if !range.contains(&spec.node_count) {
        return Err(LifecycleError::Validation(format!(
            "nodeCount must be between {MIN_NODE_COUNT} and {MAX_NODE_COUNT}, got {}",
            spec.node_count
        )));
    }
    let node_count = spec.node_count as u8;

    let kubernetes_version = match spec.kubernetes_version.as_deref() {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<KubernetesVersion>()
                .map_err(LifecycleError::Validation)?,
        ),
    };

    Ok((node_count, kubernetes_version))
}
