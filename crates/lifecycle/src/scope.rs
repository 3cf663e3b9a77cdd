//! Scoped acquisition: a resource that lives exactly as long as a block.

use std::future::Future;
use std::ops::Deref;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::manager::Manager;
use crate::resource::Resource;
use crate::spec::ResourceSpec;
use crate::tree::ResourceId;

/// A resource to create on entry and destroy on exit.
///
/// Built by [`Manager::manage`] or [`Resource::attach`]; nothing is created
/// until [`run`](Self::run) or [`enter`](Self::enter).
#[must_use = "a scope does nothing until it is run or entered"]
pub struct ScopedResourceContext {
    manager: Manager,
    spec: ResourceSpec,
    parent: Option<ResourceId>,
    keep: bool,
    timeout: Option<Duration>,
}

impl ScopedResourceContext {
    pub(crate) fn new(manager: Manager, spec: ResourceSpec, parent: Option<ResourceId>) -> Self {
        Self {
            manager,
            spec,
            parent,
            keep: false,
            timeout: None,
        }
    }

    /// Leave the resource running when the scope exits.
    ///
    /// Applies to this scope only; children attached inside it are still torn
    /// down by their own scopes.
    pub fn keep(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    /// Override the creation budget for this resource.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Create the resource and return a guard that tears it down.
    ///
    /// If the returned future is dropped while the resource is still being
    /// created, the node fails and whatever was submitted is deleted in the
    /// background.
    ///
    /// # Errors
    /// Validation, parent-state, creation and abort errors. A failed creation
    /// leaves nothing registered.
    pub async fn enter(self) -> Result<ScopeGuard> {
        let resource = self
            .manager
            .create_node(self.spec, self.parent, self.timeout)
            .await?;
        if self.keep {
            resource.set_retained();
        }
        Ok(ScopeGuard {
            resource,
            keep: self.keep,
            armed: true,
        })
    }

    /// Create the resource, run `body` with it, then tear it down.
    ///
    /// Teardown runs whether the body succeeds or fails. When both fail the
    /// body's error is returned and the teardown error is logged. If the
    /// returned future is dropped mid-body the guard spawns the teardown.
    ///
    /// # Errors
    /// The body's error, or creation/teardown errors converted into `E`.
    pub async fn run<F, Fut, T, E>(self, body: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Resource) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<Error>,
    {
        let guard = self.enter().await?;
        let outcome = body(guard.resource().clone()).await;
        let path = guard.resource().path();
        let teardown = guard.exit().await;

        match (outcome, teardown) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                if let Some(path) = path {
                    error!(resource = %path, error = %teardown, "Teardown failed after scope error");
                } else {
                    error!(error = %teardown, "Teardown failed after scope error");
                }
                Err(e)
            }
        }
    }
}

/// Live resource of an entered scope.
///
/// Call [`exit`](Self::exit) to tear down and observe errors. A guard dropped
/// without `exit` spawns the teardown on the current tokio runtime; outside a
/// runtime the resource stays registered for [`Manager::abort`].
#[must_use = "dropping the guard tears the resource down in the background"]
pub struct ScopeGuard {
    resource: Resource,
    keep: bool,
    armed: bool,
}

impl ScopeGuard {
    #[must_use]
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Leave the scope: tear down unless kept.
    ///
    /// # Errors
    /// [`Error::Teardown`] listing every node that failed.
    pub async fn exit(mut self) -> Result<()> {
        self.armed = false;
        if self.keep {
            if let Some(path) = self.resource.path() {
                info!(resource = %path, "Keeping resource");
            }
            return Ok(());
        }
        self.resource.destroy().await
    }
}

impl Deref for ScopeGuard {
    type Target = Resource;

    fn deref(&self) -> &Resource {
        &self.resource
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if !self.armed || self.keep {
            return;
        }
        let resource = self.resource.clone();
        let task = async move {
            if let Err(e) = resource.destroy().await {
                error!(resource = %resource.id(), error = %e, "Background teardown failed");
            }
        };
        if self.resource.manager().spawn_background(task) {
            warn!(resource = %self.resource.id(), "Scope left without exit, tearing down in background");
        } else {
            warn!(
                resource = %self.resource.id(),
                "Scope left without exit and no runtime; resource stays registered"
            );
        }
    }
}
