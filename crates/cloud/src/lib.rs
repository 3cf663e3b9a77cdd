//! GKE integration for the resource lifecycle manager.
//!
//! - [`gke::Gke`] - control plane for clusters, node pools and deployments
//! - [`workloads::KubeWorkloads`] - manifests and readiness checks on a cluster
//! - [`manifest`] - loading manifests from disk or GitHub
//! - [`gcs::GcsModelRepo`] - exporting model repositories to Cloud Storage
//!
//! ## Handles
//!
//! Remote handles are GKE resource paths relative to the API root:
//!
//! ```text
//! projects/{project}/locations/{location}/clusters/{cluster}
//! projects/{project}/locations/{location}/clusters/{cluster}/nodePools/{pool}
//! {cluster or node pool handle}/deployments/{namespace}/{name}
//! ```

pub mod error;
pub mod gcs;
pub mod gke;
pub mod manifest;
pub mod workloads;

pub use error::CloudError;
pub use gcs::{ExportOptions, GcsModelRepo};
pub use gke::{Gke, GpuNodePoolConfig, GpuType, TokenSource};
pub use workloads::{DeploymentProgress, KubeWorkloads};
