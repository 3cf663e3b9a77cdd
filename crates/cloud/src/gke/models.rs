//! GKE API request and response models.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Clusters
// ============================================================================

/// GKE cluster information.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GkeCluster {
    /// Cluster name.
    pub name: String,
    /// Cluster self link.
    pub self_link: Option<String>,
    /// Zone or region.
    #[serde(default)]
    pub location: String,
    /// Cluster status (`PROVISIONING`, `RUNNING`, ...).
    #[serde(default)]
    pub status: String,
    /// Human-readable detail for the current status.
    pub status_message: Option<String>,
    /// Kubernetes master version.
    pub current_master_version: Option<String>,
    /// API server endpoint (IP address, no scheme).
    pub endpoint: Option<String>,
    /// Credentials for the API server.
    pub master_auth: Option<MasterAuth>,
    /// Node pools.
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
    /// Create time.
    pub create_time: Option<String>,
    /// Current node count (total across all pools).
    pub current_node_count: Option<i32>,
}

/// API server authentication material.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterAuth {
    /// Base64-encoded PEM of the cluster CA.
    pub cluster_ca_certificate: Option<String>,
}

/// Response of `clusters.list`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterListResponse {
    /// Clusters in the location.
    #[serde(default)]
    pub clusters: Vec<GkeCluster>,
}

// ============================================================================
// Node pools
// ============================================================================

/// GKE node pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePool {
    /// Node pool name.
    pub name: String,
    /// Node pool status.
    pub status: Option<String>,
    /// Human-readable detail for the current status.
    pub status_message: Option<String>,
    /// Node config.
    pub config: Option<NodeConfig>,
    /// Initial node count.
    pub initial_node_count: Option<i32>,
}

/// Node configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeConfig {
    /// Machine type.
    #[serde(default)]
    pub machine_type: String,
    /// Attached accelerators.
    #[serde(default)]
    pub accelerators: Vec<Accelerator>,
}

/// Accelerator attached to every node of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Accelerator {
    /// GPUs per node.
    #[serde(with = "int64_string")]
    pub accelerator_count: u32,
    /// Accelerator type, e.g. `nvidia-tesla-t4`.
    pub accelerator_type: String,
}

// ============================================================================
// Requests
// ============================================================================

/// Create cluster request. The definition is free-form JSON.
#[derive(Debug, Serialize)]
pub struct CreateClusterRequest {
    /// Cluster definition including its name.
    pub cluster: Map<String, Value>,
}

/// Create node pool request. The definition is free-form JSON.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNodePoolRequest {
    /// Node pool definition including its name.
    pub node_pool: Map<String, Value>,
}

// ============================================================================
// Operations
// ============================================================================

/// Long-running GKE operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Operation name, unique within the location.
    pub name: String,
    /// `PENDING`, `RUNNING`, `DONE` or `ABORTING`.
    #[serde(default)]
    pub status: String,
    /// Operation type, e.g. `CREATE_CLUSTER`.
    pub operation_type: Option<String>,
    /// Human-readable detail, set on failure.
    pub status_message: Option<String>,
    /// Set when a finished operation failed.
    pub error: Option<OperationError>,
}

/// Error detail of a failed operation.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationError {
    /// gRPC status code.
    #[serde(default)]
    pub code: i32,
    /// Error message.
    #[serde(default)]
    pub message: String,
}

impl Operation {
    /// Whether the operation has finished, successfully or not.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.status == "DONE"
    }

    /// Failure detail of a finished operation, `None` on success.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        if let Some(error) = &self.error {
            if error.code != 0 || !error.message.is_empty() {
                return Some(error.message.clone());
            }
        }
        match self.status.as_str() {
            "ABORTING" => Some(
                self.status_message
                    .clone()
                    .unwrap_or_else(|| "operation aborted".to_string()),
            ),
            _ => None,
        }
    }
}

// ============================================================================
// Errors and metadata
// ============================================================================

/// Error envelope returned by Google APIs.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    pub error: ApiErrorBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: u16,
    #[serde(default)]
    pub message: String,
    /// Canonical status, e.g. `FAILED_PRECONDITION`.
    pub status: Option<String>,
}

/// Access token issued by the metadata server.
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataToken {
    pub access_token: String,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: u64,
    pub token_type: Option<String>,
}

/// Google APIs encode int64 fields as JSON strings but accept numbers.
mod int64_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u32),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(n),
            Raw::Text(s) => s.parse().map_err(de::Error::custom),
        }
    }
}
