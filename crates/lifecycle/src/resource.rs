//! Handles to live resource nodes.

use std::fmt;

use tracing::info;

use crate::control_plane::{Manifest, RemoteHandle};
use crate::error::{Error, Result};
use crate::machine::Teardown;
use crate::manager::Manager;
use crate::scope::ScopedResourceContext;
use crate::spec::{ResourceKind, ResourceSpec};
use crate::state::ResourceState;
use crate::tree::{Node, ResourceId, ResourcePath};

/// A resource node owned by a [`Manager`].
///
/// The handle is only an id plus the manager; every accessor reads the
/// current state of the shared tree.
#[derive(Clone)]
pub struct Resource {
    id: ResourceId,
    manager: Manager,
}

impl Resource {
    pub(crate) fn new(id: ResourceId, manager: Manager) -> Self {
        Self { id, manager }
    }

    fn read<T>(&self, f: impl FnOnce(&Node) -> T) -> Option<T> {
        self.manager.lock().tree.get(self.id).map(f)
    }

    #[must_use]
    pub fn id(&self) -> ResourceId {
        self.id
    }

    #[must_use]
    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    #[must_use]
    pub fn spec(&self) -> Option<ResourceSpec> {
        self.read(|node| node.spec.clone())
    }

    #[must_use]
    pub fn kind(&self) -> Option<ResourceKind> {
        self.read(|node| node.spec.kind())
    }

    #[must_use]
    pub fn name(&self) -> String {
        self.read(|node| node.spec.name().to_string())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn state(&self) -> ResourceState {
        self.read(Node::state).unwrap_or(ResourceState::Destroyed)
    }

    #[must_use]
    pub fn path(&self) -> Option<ResourcePath> {
        self.read(|node| node.path.clone())
    }

    /// Control-plane identifier, set once the resource is ready.
    #[must_use]
    pub fn remote_handle(&self) -> Option<RemoteHandle> {
        self.read(|node| node.remote_handle.clone()).flatten()
    }

    #[must_use]
    pub fn parent(&self) -> Option<Resource> {
        self.read(|node| node.parent)
            .flatten()
            .map(|id| Resource::new(id, self.manager.clone()))
    }

    /// Live children in creation order.
    #[must_use]
    pub fn children(&self) -> Vec<Resource> {
        self.read(|node| node.children.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|id| Resource::new(id, self.manager.clone()))
            .collect()
    }

    /// Whether a `keep` scope left this resource alive on purpose.
    #[must_use]
    pub fn is_retained(&self) -> bool {
        self.read(|node| node.retained).unwrap_or(false)
    }

    pub(crate) fn set_retained(&self) {
        if let Some(node) = self.manager.lock().tree.get_mut(self.id) {
            node.retained = true;
        }
    }

    /// Scoped child resource. Nothing happens until the scope is entered.
    pub fn attach(&self, spec: ResourceSpec) -> ScopedResourceContext {
        ScopedResourceContext::new(self.manager.clone(), spec, Some(self.id))
    }

    /// Create a child outside any scope. It is torn down with this resource.
    ///
    /// # Errors
    /// [`Error::InvalidParentState`] unless this resource is ready, plus the
    /// usual validation and creation errors.
    pub async fn create_child(&self, spec: ResourceSpec) -> Result<Resource> {
        self.manager.create_node(spec, Some(self.id), None).await
    }

    /// Tear down this resource and everything below it.
    ///
    /// Destroying an already destroyed or failed resource does nothing. The
    /// cascade keeps running if the returned future is dropped.
    ///
    /// # Errors
    /// [`Error::Teardown`] listing every node that failed.
    pub async fn destroy(&self) -> Result<()> {
        self.manager
            .teardown(self.id, Teardown::Full)
            .await
            .into_result()
    }

    /// Apply `manifest` to the cluster this resource belongs to.
    ///
    /// Only ready clusters and node pools accept workloads; a node pool
    /// forwards to its cluster.
    ///
    /// # Errors
    /// [`Error::InvalidParentState`] if not ready, [`Error::Validation`] for a
    /// deployment target, [`Error::DeployError`] when the applier fails or none
    /// is configured.
    pub async fn deploy(&self, manifest: &Manifest) -> Result<()> {
        let (path, cluster) = {
            let state = self.manager.lock();
            let node = state
                .tree
                .get(self.id)
                .ok_or(Error::UnknownResource(self.id))?;
            if node.state() != ResourceState::Ready {
                return Err(Error::InvalidParentState {
                    resource: node.path.clone(),
                    state: node.state(),
                });
            }
            let cluster = match node.spec.kind() {
                ResourceKind::Cluster => node.remote_handle.clone(),
                ResourceKind::NodePool => node
                    .parent
                    .and_then(|p| state.tree.get(p))
                    .and_then(|p| p.remote_handle.clone()),
                ResourceKind::Deployment => {
                    return Err(Error::Validation(format!(
                        "cannot deploy into deployment {}",
                        node.path
                    )))
                }
            };
            (node.path.clone(), cluster)
        };

        let deploy_error = |detail: String| Error::DeployError {
            resource: path.clone(),
            detail,
        };
        let cluster = cluster.ok_or_else(|| deploy_error("cluster has no remote handle".into()))?;
        let applier = self
            .manager
            .inner
            .workloads
            .as_ref()
            .ok_or_else(|| deploy_error("no workload applier configured".into()))?;

        info!(resource = %path, manifest = manifest.name(), "Deploying manifest");
        applier
            .deploy(&cluster, manifest)
            .await
            .map_err(|e| deploy_error(e.to_string()))
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Resource");
        s.field("id", &self.id);
        if let Some(path) = self.path() {
            s.field("path", &format_args!("{path}"));
        }
        s.field("state", &self.state()).finish()
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && std::sync::Arc::ptr_eq(&self.manager.inner, &other.manager.inner)
    }
}

impl Eq for Resource {}
