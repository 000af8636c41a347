//! Kind cluster-config documents.
//!
//! The workflow only needs "a document for this topology"; the Kind-specific
//! serialization lives behind [`ClusterConfigBuilder`] so it can be swapped.

use crate::types::KubernetesVersion;

/// Optional knobs that influence the generated document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterOptions {
    pub kubernetes_version: Option<KubernetesVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Worker => "worker",
        }
    }
}

/// One control-plane node followed by `node_count - 1` workers.
pub fn topology(node_count: u8) -> Vec<NodeRole> {
    let mut nodes = vec![NodeRole::ControlPlane];
    nodes.extend((1..node_count).map(|_| NodeRole::Worker));
    nodes
}

/// Produces the config document handed to the cluster provisioner.
pub trait ClusterConfigBuilder: Send + Sync {
    /// Pure function of its inputs.
    fn build(&self, node_count: u8, options: &ClusterOptions) -> String;

    /// File suffix for the temporary document (e.g. `.yaml`).
    fn file_suffix(&self) -> &str {
        ".yaml"
    }
}

/// Emits `kind.x-k8s.io/v1alpha4` Cluster documents.
#[derive(Debug, Clone, Copy, Default)]
pub struct KindConfigBuilder;

impl ClusterConfigBuilder for KindConfigBuilder {
    fn build(&self, node_count: u8, options: &ClusterOptions) -> String {
        let mut doc = String::from("kind: Cluster\napiVersion: kind.x-k8s.io/v1alpha4\nnodes:\n");
        for role in topology(node_count) {
            doc.push_str("- role: ");
            doc.push_str(role.as_str());
            doc.push('\n');
            if let Some(version) = options.kubernetes_version {
                doc.push_str("  image: ");
                doc.push_str(version.node_image());
                doc.push('\n');
            }
        }
        doc
    }
}
