//! GPU clusters on GKE for AI/ML workloads.
//!
//! The `gpu` binary brings up a cluster with a GPU node pool, installs
//! NVIDIA drivers, deploys workloads and tears everything down when it
//! exits:
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ cluster (default pool: e2-standard-4)         │
//! │  └─ nodePool gpu-pool (n1-standard-8 + T4)    │
//! │      └─ deployment triton                     │
//! └───────────────────────────────────────────────┘
//!          torn down bottom-up, newest first
//! ```

pub mod plan;

pub use plan::{deployment_spec, GpuClusterPlan, DEFAULT_POOL};
