//! Resource specs for a GPU cluster: a small system pool for cluster add-ons
//! plus a GPU node pool that workloads are scheduled on.

use cloud::gke::OAUTH_SCOPES;
use cloud::GpuNodePoolConfig;
use lifecycle::{Manifest, ResourceSpec};
use serde_json::{json, Value};

/// Node pool name used when none is given.
pub const DEFAULT_POOL: &str = "gpu-pool";

/// What `gpu up` creates.
#[derive(Debug, Clone)]
pub struct GpuClusterPlan {
    /// Cluster name.
    pub cluster: String,
    /// Machine type of the default (non-GPU) pool.
    pub machine_type: String,
    /// Nodes in the default pool.
    pub nodes: u32,
    /// GPU node pool name.
    pub pool: String,
    /// GPU node pool shape.
    pub gpu: GpuNodePoolConfig,
}

impl GpuClusterPlan {
    #[must_use]
    pub fn cluster_spec(&self) -> ResourceSpec {
        ResourceSpec::cluster(
            &self.cluster,
            json!({
                "initialNodeCount": self.nodes.max(1),
                "nodeConfig": {
                    "machineType": self.machine_type,
                    "oauthScopes": OAUTH_SCOPES,
                },
            }),
        )
    }

    #[must_use]
    pub fn pool_spec(&self) -> ResourceSpec {
        ResourceSpec::node_pool(&self.pool, self.gpu.to_configuration())
    }
}

/// Tracked deployment `name` created from `manifest` in `namespace`.
#[must_use]
pub fn deployment_spec(name: &str, manifest: &Manifest, namespace: &str) -> ResourceSpec {
    ResourceSpec::deployment(name, deployment_configuration(manifest, namespace))
}

fn deployment_configuration(manifest: &Manifest, namespace: &str) -> Value {
    json!({
        "manifest": manifest.yaml(),
        "namespace": namespace,
    })
}
