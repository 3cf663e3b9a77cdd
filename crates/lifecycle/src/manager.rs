//! The resource manager: owns the tree, the registry of live resources and
//! the collaborators every lifecycle operation talks to.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::config::LifecycleConfig;
use crate::control_plane::{ControlPlane, RemoteHandle, WorkloadApplier};
use crate::error::{Error, Result, TeardownErrors};
use crate::machine::Teardown;
use crate::resource::Resource;
use crate::scope::ScopedResourceContext;
use crate::spec::ResourceSpec;
use crate::tree::{ActiveResource, Registry, ResourceId, Tree};

pub(crate) struct ManagerState {
    pub tree: Tree,
    pub registry: Registry,
}

pub(crate) struct Inner {
    pub control_plane: Arc<dyn ControlPlane>,
    pub workloads: Option<Arc<dyn WorkloadApplier>>,
    pub config: LifecycleConfig,
    pub cancel: CancellationToken,
    /// Teardowns and abandon deletes running detached from their caller.
    pub tasks: TaskTracker,
    state: Mutex<ManagerState>,
}

/// Entry point for creating and tearing down resource trees.
///
/// Cheap to clone; clones share the same tree. Separate `Manager::new` calls
/// produce fully independent managers.
#[derive(Clone)]
pub struct Manager {
    pub(crate) inner: Arc<Inner>,
}

impl Manager {
    pub fn new(control_plane: Arc<dyn ControlPlane>, config: LifecycleConfig) -> Self {
        Self::build(control_plane, None, config)
    }

    /// Manager that can also push manifests with [`Resource::deploy`].
    pub fn with_workloads(
        control_plane: Arc<dyn ControlPlane>,
        workloads: Arc<dyn WorkloadApplier>,
        config: LifecycleConfig,
    ) -> Self {
        Self::build(control_plane, Some(workloads), config)
    }

    fn build(
        control_plane: Arc<dyn ControlPlane>,
        workloads: Option<Arc<dyn WorkloadApplier>>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                control_plane,
                workloads,
                config,
                cancel: CancellationToken::new(),
                tasks: TaskTracker::new(),
                state: Mutex::new(ManagerState {
                    tree: Tree::default(),
                    registry: Registry::default(),
                }),
            }),
        }
    }

    /// Never held across an await point.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `task` on the current runtime, tracked so [`Manager::abort`] waits
    /// for it. Returns `false` outside a runtime.
    pub(crate) fn spawn_background<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                self.inner.tasks.spawn_on(task, &handle);
                true
            }
            Err(_) => false,
        }
    }

    #[must_use]
    pub fn config(&self) -> &LifecycleConfig {
        &self.inner.config
    }

    /// Scoped root resource. Nothing happens until the scope is entered.
    pub fn manage(&self, spec: ResourceSpec) -> ScopedResourceContext {
        ScopedResourceContext::new(self.clone(), spec, None)
    }

    /// Create a root resource outside any scope. The caller owns its teardown
    /// (or leaves it to [`Manager::abort`]).
    ///
    /// # Errors
    /// Validation, creation and abort errors.
    pub async fn create(&self, spec: ResourceSpec) -> Result<Resource> {
        self.create_node(spec, None, None).await
    }

    /// Track a root that already exists remotely, e.g. a cluster kept by an
    /// earlier run, so it can be torn down through the usual cascade.
    ///
    /// # Errors
    /// Validation errors, or a creation error if the object is not running.
    pub async fn adopt(&self, spec: ResourceSpec, handle: RemoteHandle) -> Result<Resource> {
        self.adopt_node(spec, None, handle).await
    }

    /// Handle for a known resource id.
    ///
    /// # Errors
    /// [`Error::UnknownResource`] if the id was not issued by this manager.
    pub fn get(&self, id: ResourceId) -> Result<Resource> {
        if self.lock().tree.get(id).is_some() {
            Ok(Resource::new(id, self.clone()))
        } else {
            Err(Error::UnknownResource(id))
        }
    }

    /// Live root resources in creation order.
    #[must_use]
    pub fn roots(&self) -> Vec<Resource> {
        self.lock()
            .tree
            .roots()
            .iter()
            .map(|id| Resource::new(*id, self.clone()))
            .collect()
    }

    /// Snapshot of every resource that may still exist remotely.
    #[must_use]
    pub fn active(&self) -> Vec<ActiveResource> {
        let state = self.lock();
        state
            .registry
            .ids()
            .filter_map(|id| {
                state.tree.get(id).map(|node| ActiveResource {
                    id,
                    path: node.path.clone(),
                    state: node.state(),
                    remote_handle: node.remote_handle.clone(),
                    retained: node.retained,
                })
            })
            .collect()
    }

    #[must_use]
    pub fn is_active(&self, id: ResourceId) -> bool {
        self.lock().registry.contains(id)
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Stop creating and tear down everything still registered.
    ///
    /// In-flight creation polls are cancelled, new creations fail with
    /// [`Error::Aborted`], and roots are destroyed newest first. Resources
    /// kept by a `keep` scope are left alone, their non-kept descendants are
    /// not. Returns once background teardowns and abandon deletes have
    /// finished as well.
    ///
    /// # Errors
    /// [`Error::Teardown`] listing every resource that could not be deleted.
    pub async fn abort(&self) -> Result<()> {
        self.inner.cancel.cancel();
        let roots = self.lock().tree.roots().to_vec();
        warn!(roots = roots.len(), "Aborting, tearing down registered resources");

        let mut errors = TeardownErrors::default();
        for root in roots.into_iter().rev() {
            errors.extend(self.teardown(root, Teardown::SkipRetained).await);
        }
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        let remaining = self.active().len();
        info!(remaining, failures = errors.len(), "Abort finished");
        errors.into_result()
    }

    /// Run [`Manager::abort`] on Ctrl-C or SIGTERM.
    pub fn abort_on_signal(&self) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            if let Err(e) = manager.abort().await {
                error!(error = %e, "Cleanup after interrupt incomplete");
            }
        })
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            warn!("Received Ctrl+C, tearing down");
        },
        () = terminate => {
            warn!("Received SIGTERM, tearing down");
        },
    }
}
