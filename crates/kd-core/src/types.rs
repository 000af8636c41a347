use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Smallest cluster: a lone control-plane node.
pub const MIN_NODE_COUNT: u8 = 1;
/// Largest cluster: one control-plane node plus nine workers.
pub const MAX_NODE_COUNT: u8 = 10;

// ---------------------------------------------------------------------------
// EnvironmentStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentStatus {
    Creating,
    Running,
    Error,
    Deleting,
}

impl EnvironmentStatus {
    /// Returns `true` when a transition from `self` to `target` is valid.
    ///
    /// `Deleting -> Running` and `Deleting -> Error` are rollbacks taken when
    /// the external cluster deletion fails and the record is kept.
    pub fn can_transition_to(&self, target: &EnvironmentStatus) -> bool {
        matches!(
            (self, target),
            (EnvironmentStatus::Creating, EnvironmentStatus::Running)
                | (EnvironmentStatus::Creating, EnvironmentStatus::Error)
                | (EnvironmentStatus::Running, EnvironmentStatus::Deleting)
                | (EnvironmentStatus::Error, EnvironmentStatus::Deleting)
                | (EnvironmentStatus::Deleting, EnvironmentStatus::Running)
                | (EnvironmentStatus::Deleting, EnvironmentStatus::Error)
        )
    }
}

impl fmt::Display for EnvironmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            EnvironmentStatus::Creating => "creating",
            EnvironmentStatus::Running => "running",
            EnvironmentStatus::Error => "error",
            EnvironmentStatus::Deleting => "deleting",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// KubernetesVersion
// ---------------------------------------------------------------------------

/// Kubernetes releases a cluster can be pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KubernetesVersion {
    #[serde(rename = "v1.27")]
    V1_27,
    #[serde(rename = "v1.28")]
    V1_28,
    #[serde(rename = "v1.29")]
    V1_29,
    #[serde(rename = "v1.30")]
    V1_30,
    #[serde(rename = "v1.31")]
    V1_31,
}

impl KubernetesVersion {
    pub const ALL: [KubernetesVersion; 5] = [
        KubernetesVersion::V1_27,
        KubernetesVersion::V1_28,
        KubernetesVersion::V1_29,
        KubernetesVersion::V1_30,
        KubernetesVersion::V1_31,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            KubernetesVersion::V1_27 => "v1.27",
            KubernetesVersion::V1_28 => "v1.28",
            KubernetesVersion::V1_29 => "v1.29",
            KubernetesVersion::V1_30 => "v1.30",
            KubernetesVersion::V1_31 => "v1.31",
        }
    }

    /// The `kindest/node` image used for every node of the cluster.
    pub fn node_image(&self) -> &'static str {
        match self {
            KubernetesVersion::V1_27 => "kindest/node:v1.27.16",
            KubernetesVersion::V1_28 => "kindest/node:v1.28.15",
            KubernetesVersion::V1_29 => "kindest/node:v1.29.12",
            KubernetesVersion::V1_30 => "kindest/node:v1.30.8",
            KubernetesVersion::V1_31 => "kindest/node:v1.31.4",
        }
    }
}

impl fmt::Display for KubernetesVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KubernetesVersion {
    type Err = String;

    /// Accepts `v1.29` and `1.29`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let normalized = trimmed.strip_prefix('v').unwrap_or(trimmed);
        KubernetesVersion::ALL
            .into_iter()
            .find(|v| &v.as_str()[1..] == normalized)
            .ok_or_else(|| {
                let supported: Vec<&str> =
                    KubernetesVersion::ALL.iter().map(|v| v.as_str()).collect();
                format!(
                    "unsupported kubernetes version '{s}' (supported: {})",
                    supported.join(", ")
                )
            })
    }
}

// ---------------------------------------------------------------------------
// EnvironmentSpec
// ---------------------------------------------------------------------------

/// Unvalidated creation request as it arrives from a client.
///
/// `node_count` is deliberately wide so that out-of-range values are
/// rejected by validation rather than by deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentSpec {
    pub node_count: i64,
    #[serde(default)]
    pub kubernetes_version: Option<String>,
    #[serde(default)]
    pub install_mesh: bool,
}

impl EnvironmentSpec {
    pub fn with_nodes(node_count: i64) -> Self {
        Self {
            node_count,
            kubernetes_version: None,
            install_mesh: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// One ephemeral Kind cluster tracked by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: Uuid,
    pub name: String,
    pub node_count: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<KubernetesVersion>,
    #[serde(default)]
    pub install_mesh: bool,
    pub status: EnvironmentStatus,
    #[serde(default)]
    pub control_plane_container_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Why provisioning failed, set together with `EnvironmentStatus::Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Why the best-effort mesh install failed. The environment stays running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_error: Option<String>,
}

impl Environment {
    /// Derive the cluster name from an environment id.
    pub fn name_for(id: &Uuid) -> String {
        let simple = id.simple().to_string();
        format!("kd-{}", &simple[..12])
    }

    /// Name filter matching this cluster's control-plane container.
    pub fn control_plane_container_name(&self) -> String {
        format!("{}-control-plane", self.name)
    }

    /// The kubeconfig context Kind registers for this cluster.
    pub fn kube_context(&self) -> String {
        format!("kind-{}", self.name)
    }

    /// A terminal may attach only to a running environment whose
    /// control-plane container has been located.
    pub fn is_attachable(&self) -> bool {
        self.status == EnvironmentStatus::Running && self.control_plane_container_id.is_some()
    }
}
