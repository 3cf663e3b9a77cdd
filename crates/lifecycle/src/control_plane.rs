//! Boundary to the remote services the lifecycle manager drives.
//!
//! The manager never talks HTTP itself. It calls a [`ControlPlane`] for
//! create/delete/status of cloud objects and a [`WorkloadApplier`] for pushing
//! manifests into a ready cluster. Every call is treated as slow and
//! eventually consistent.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::spec::ResourceSpec;

/// Identifier of an object on the control plane.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteHandle(String);

impl RemoteHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RemoteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A long-running remote operation and the object it acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationHandle {
    /// Operation identifier, meaningful to the control plane only.
    pub id: String,
    /// The object being created or deleted.
    pub target: RemoteHandle,
}

/// Outcome of submitting a create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    /// The control plane accepted the request and started an operation.
    Started(OperationHandle),
    /// The object already exists; the caller should attach to it.
    Exists(RemoteHandle),
}

/// State of a long-running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Ready,
    Error(String),
}

/// Live state of a remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveStatus {
    Provisioning,
    Running,
    Stopping,
    Error(String),
    /// The object does not exist (any more).
    Gone,
}

/// What the control plane needs to create one resource.
#[derive(Debug, Clone, Copy)]
pub struct CreateRequest<'a> {
    pub spec: &'a ResourceSpec,
    /// Remote handle of the owning resource, `None` for roots.
    pub parent: Option<&'a RemoteHandle>,
}

/// Errors returned by remote collaborators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The object is tied up (operation in progress, still referenced); retry later.
    #[error("Busy: {0}")]
    Busy(String),

    /// The request was refused (quota, invalid config, permissions).
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The request never got a definitive answer.
    #[error("Transport error: {0}")]
    Transport(String),
}

impl RemoteError {
    /// Whether retrying within the poll budget may help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Transport(_))
    }
}

/// Remote control plane that owns the actual cloud objects.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Submit creation of `request.spec`.
    async fn submit_create(&self, request: CreateRequest<'_>) -> Result<Submission, RemoteError>;

    /// Poll a long-running operation.
    async fn poll_operation(
        &self,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, RemoteError>;

    /// Submit deletion of an object.
    async fn submit_delete(&self, handle: &RemoteHandle) -> Result<OperationHandle, RemoteError>;

    /// Current live status of an object. A missing object is [`LiveStatus::Gone`].
    async fn get_status(&self, handle: &RemoteHandle) -> Result<LiveStatus, RemoteError>;
}

/// A workload manifest (one or more YAML documents).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    name: String,
    yaml: String,
}

impl Manifest {
    pub fn new(name: impl Into<String>, yaml: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            yaml: yaml.into(),
        }
    }

    /// Human-readable origin, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn yaml(&self) -> &str {
        &self.yaml
    }
}

/// Applies workload manifests to a ready cluster.
#[async_trait]
pub trait WorkloadApplier: Send + Sync {
    /// Apply `manifest` to the cluster identified by `cluster`.
    async fn deploy(&self, cluster: &RemoteHandle, manifest: &Manifest) -> Result<(), RemoteError>;
}
