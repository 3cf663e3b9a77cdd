//! Error taxonomy for the lifecycle manager.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::state::ResourceState;
use crate::tree::{ResourceId, ResourcePath};

/// Result type used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by lifecycle operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad or conflicting spec. Raised locally, never after a remote call.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The control plane never reported the resource ready within its budget.
    #[error("Timed out after {timeout:?} ({attempts} polls) waiting for {resource} to become ready")]
    CreationTimeout {
        resource: ResourcePath,
        timeout: Duration,
        attempts: u32,
    },

    /// The control plane reported a terminal creation failure.
    #[error("Control plane failed to create {resource}: {detail}")]
    CreationError {
        resource: ResourcePath,
        detail: String,
    },

    /// Deletion was not confirmed within the teardown budget.
    #[error("Timed out after {timeout:?} waiting for {resource} to be deleted")]
    TeardownTimeout {
        resource: ResourcePath,
        timeout: Duration,
    },

    /// The control plane rejected the deletion.
    #[error("Control plane rejected deletion of {resource}: {detail}")]
    TeardownError {
        resource: ResourcePath,
        detail: String,
    },

    /// An operation needed a `Ready` resource.
    #[error("{resource} is {state}, expected ready")]
    InvalidParentState {
        resource: ResourcePath,
        state: ResourceState,
    },

    /// The external workload applier failed.
    #[error("Deploy to {resource} failed: {detail}")]
    DeployError {
        resource: ResourcePath,
        detail: String,
    },

    /// The manager was aborted; no new resources are created.
    #[error("Resource manager aborted")]
    Aborted,

    /// The id does not name a resource known to this manager.
    #[error("Unknown resource: {0}")]
    UnknownResource(ResourceId),

    /// One or more nodes failed to tear down.
    #[error(transparent)]
    Teardown(#[from] TeardownErrors),

    /// Lifecycle configuration could not be loaded.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Aggregate of every per-node teardown failure of one destroy cascade.
///
/// Entries are [`Error::TeardownTimeout`] or [`Error::TeardownError`], in the
/// order the failures happened (leaves first).
#[derive(Debug, Default)]
pub struct TeardownErrors {
    failures: Vec<Error>,
}

impl TeardownErrors {
    #[must_use]
    pub fn failures(&self) -> &[Error] {
        &self.failures
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.failures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    /// Paths of the resources that failed to tear down.
    pub fn resources(&self) -> impl Iterator<Item = &ResourcePath> {
        self.failures.iter().filter_map(|e| match e {
            Error::TeardownTimeout { resource, .. } | Error::TeardownError { resource, .. } => {
                Some(resource)
            }
            _ => None,
        })
    }

    pub(crate) fn push(&mut self, error: Error) {
        self.failures.push(error);
    }

    pub(crate) fn extend(&mut self, other: TeardownErrors) {
        self.failures.extend(other.failures);
    }

    /// `Ok(())` when nothing failed.
    pub(crate) fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(self))
        }
    }
}

impl fmt::Display for TeardownErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} resource(s) failed to tear down", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TeardownErrors {}
