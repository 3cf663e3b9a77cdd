//! GPU node pool definitions.

use std::fmt;
use std::str::FromStr;

use serde_json::{json, Value};

use super::models::Accelerator;
use crate::error::CloudError;

/// Scopes granted to GPU nodes: image pulls, logging, monitoring and tracing.
pub const OAUTH_SCOPES: [&str; 6] = [
    "https://www.googleapis.com/auth/devstorage.read_only",
    "https://www.googleapis.com/auth/logging.write",
    "https://www.googleapis.com/auth/monitoring",
    "https://www.googleapis.com/auth/service.management.readonly",
    "https://www.googleapis.com/auth/servicecontrol",
    "https://www.googleapis.com/auth/trace.append",
];

/// vCPU counts offered by the `n1-standard` machine family.
pub const N1_STANDARD_VCPUS: [u32; 8] = [1, 2, 4, 8, 16, 32, 64, 96];

/// Maximum GPUs attachable to one N1 node.
pub const MAX_GPUS_PER_NODE: u32 = 8;

/// NVIDIA accelerators available on N1 machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuType {
    T4,
    V100,
    P100,
    P4,
    K80,
}

impl GpuType {
    /// GKE accelerator type, e.g. `nvidia-tesla-t4`.
    #[must_use]
    pub fn accelerator_type(self) -> &'static str {
        match self {
            Self::T4 => "nvidia-tesla-t4",
            Self::V100 => "nvidia-tesla-v100",
            Self::P100 => "nvidia-tesla-p100",
            Self::P4 => "nvidia-tesla-p4",
            Self::K80 => "nvidia-tesla-k80",
        }
    }
}

impl fmt::Display for GpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::T4 => "t4",
            Self::V100 => "v100",
            Self::P100 => "p100",
            Self::P4 => "p4",
            Self::K80 => "k80",
        };
        f.write_str(name)
    }
}

impl FromStr for GpuType {
    type Err = CloudError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().trim_start_matches("nvidia-tesla-") {
            "t4" => Ok(Self::T4),
            "v100" => Ok(Self::V100),
            "p100" => Ok(Self::P100),
            "p4" => Ok(Self::P4),
            "k80" => Ok(Self::K80),
            other => Err(CloudError::Config(format!(
                "unknown GPU type '{other}', expected one of t4, v100, p100, p4, k80"
            ))),
        }
    }
}

/// Node pool of `n1-standard` machines with NVIDIA GPUs attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuNodePoolConfig {
    vcpus: u32,
    gpus: u32,
    gpu_type: GpuType,
    node_count: u32,
}

impl GpuNodePoolConfig {
    /// One node with `gpus` GPUs of `gpu_type` on an `n1-standard-{vcpus}` machine.
    ///
    /// # Errors
    /// [`CloudError::Config`] for a vCPU count N1 does not offer or a GPU
    /// count outside `1..=8`.
    pub fn new(vcpus: u32, gpus: u32, gpu_type: GpuType) -> Result<Self, CloudError> {
        if !N1_STANDARD_VCPUS.contains(&vcpus) {
            return Err(CloudError::Config(format!(
                "n1-standard machines have {N1_STANDARD_VCPUS:?} vCPUs, got {vcpus}"
            )));
        }
        if !(1..=MAX_GPUS_PER_NODE).contains(&gpus) {
            return Err(CloudError::Config(format!(
                "between 1 and {MAX_GPUS_PER_NODE} GPUs per node are supported, got {gpus}"
            )));
        }
        Ok(Self {
            vcpus,
            gpus,
            gpu_type,
            node_count: 1,
        })
    }

    #[must_use]
    pub fn node_count(mut self, node_count: u32) -> Self {
        self.node_count = node_count.max(1);
        self
    }

    #[must_use]
    pub fn machine_type(&self) -> String {
        format!("n1-standard-{}", self.vcpus)
    }

    #[must_use]
    pub fn accelerator(&self) -> Accelerator {
        Accelerator {
            accelerator_count: self.gpus,
            accelerator_type: self.gpu_type.accelerator_type().to_string(),
        }
    }

    /// Node pool definition for the GKE API, without the name.
    #[must_use]
    pub fn to_configuration(&self) -> Value {
        json!({
            "initialNodeCount": self.node_count,
            "config": {
                "machineType": self.machine_type(),
                "oauthScopes": OAUTH_SCOPES,
                "accelerators": [self.accelerator()],
            },
        })
    }
}
