//! Google Kubernetes Engine.
//!
//! [`Gke`] implements the lifecycle control plane for clusters, node pools
//! and deployments, and applies manifests as a workload applier.
//!
//! ## GPU Node Pools
//!
//! [`GpuNodePoolConfig`] builds node pool definitions for `n1-standard`
//! machines with NVIDIA accelerators:
//! - **t4**: inference, cheapest per GPU
//! - **v100**, **p100**: training
//! - **p4**, **k80**: legacy

mod client;
mod gpu;
mod models;
mod token;

pub use client::{live_status, Gke, DEFAULT_BASE_URL};
pub use gpu::{GpuNodePoolConfig, GpuType, MAX_GPUS_PER_NODE, N1_STANDARD_VCPUS, OAUTH_SCOPES};
pub use models::*;
pub use token::{TokenProvider, TokenSource, METADATA_TOKEN_URL};
