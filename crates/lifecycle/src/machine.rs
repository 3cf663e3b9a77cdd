//! Create and destroy state machines.
//!
//! Both run as plain async code on the caller's task. The manager lock only
//! guards the bookkeeping steps between remote calls.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PollPolicy;
use crate::control_plane::{
    CreateRequest, LiveStatus, OperationHandle, OperationStatus, RemoteError, RemoteHandle,
    Submission,
};
use crate::error::{Error, Result, TeardownErrors};
use crate::manager::Manager;
use crate::poll::{deadline_after, poll_until, PollOutcome, Step};
use crate::resource::Resource;
use crate::spec::{ResourceKind, ResourceSpec};
use crate::state::ResourceState;
use crate::tree::{ResourceId, ResourcePath};

/// How a destroy cascade treats resources kept by a `keep` scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    /// Delete everything below and including the start node.
    Full,
    /// Leave retained nodes alive but still visit their children.
    SkipRetained,
}

/// What the reservation step decided under the lock.
enum Reservation {
    /// A matching live node is ready.
    Ready(ResourceId),
    /// A matching node is busy; wait for it and look again.
    Busy(watch::Receiver<ResourceState>),
    /// A fresh node was inserted in `Creating`.
    New {
        id: ResourceId,
        path: ResourcePath,
        parent: Option<RemoteHandle>,
    },
}

/// What a destroy cascade does with one node.
enum Visit {
    /// Already gone or failed.
    Done,
    /// Another operation is in flight; wait and look again.
    Wait(watch::Receiver<ResourceState>),
    /// Retained: leave the node, visit its children.
    Children(Vec<ResourceId>),
    /// Now `Destroying`; tear down children, then the node.
    Destroy {
        kind: ResourceKind,
        path: ResourcePath,
        children: Vec<ResourceId>,
        handle: Option<RemoteHandle>,
    },
}

/// Fails a `Creating` node whose create future is dropped before it settles,
/// so nothing waits on it forever.
struct CreationGuard<'a> {
    manager: &'a Manager,
    id: ResourceId,
    armed: bool,
}

impl<'a> CreationGuard<'a> {
    fn new(manager: &'a Manager, id: ResourceId) -> Self {
        Self {
            manager,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some((kind, target)) = self.manager.forget_creation(self.id) else {
            return;
        };
        warn!(resource = %self.id, remote = %target, "Creation interrupted, abandoning");
        let manager = self.manager.clone();
        let spawned = self.manager.spawn_background(async move {
            manager.abandon_remote(kind, &target).await;
        });
        if !spawned {
            warn!(resource = %self.id, "No runtime to delete the abandoned resource");
        }
    }
}

/// Wait until no operation is in flight on the node behind `rx`.
async fn settled(mut rx: watch::Receiver<ResourceState>) {
    // A closed channel means the manager is gone; nothing left to wait for.
    let _ = rx.wait_for(|state| state.is_settled()).await;
}

/// Same policy with the budget left before `deadline`.
fn remaining(policy: &PollPolicy, deadline: Instant) -> PollPolicy {
    PollPolicy {
        timeout: deadline.saturating_duration_since(Instant::now()),
        ..*policy
    }
}

fn retry_or_fail<T>(resource: &ResourcePath, error: RemoteError) -> Step<T> {
    if error.is_transient() {
        warn!(resource = %resource, error = %error, "Transient control plane error, retrying");
        Step::Continue
    } else {
        Step::Fail(error.to_string())
    }
}

impl Manager {
    fn reserve(&self, spec: &ResourceSpec, parent: Option<ResourceId>) -> Result<Reservation> {
        if self.inner.cancel.is_cancelled() {
            return Err(Error::Aborted);
        }

        let mut state = self.lock();
        let parent_remote = match parent {
            None => {
                if !spec.kind().accepts_parent(None) {
                    return Err(Error::Validation(format!(
                        "a {} cannot be a root resource",
                        spec.kind()
                    )));
                }
                None
            }
            Some(pid) => {
                let node = state.tree.get(pid).ok_or(Error::UnknownResource(pid))?;
                if !spec.kind().accepts_parent(Some(node.spec.kind())) {
                    return Err(Error::Validation(format!(
                        "a {} cannot be created under {} {}",
                        spec.kind(),
                        node.spec.kind(),
                        node.path
                    )));
                }
                if node.state() != ResourceState::Ready {
                    return Err(Error::InvalidParentState {
                        resource: node.path.clone(),
                        state: node.state(),
                    });
                }
                node.remote_handle.clone()
            }
        };

        if let Some(existing) = state.tree.find(parent, spec.name()) {
            if let Some(node) = state.tree.get(existing) {
                if node.spec != *spec {
                    return Err(Error::Validation(format!(
                        "{} already exists with a different specification",
                        node.path
                    )));
                }
                return Ok(match node.state() {
                    ResourceState::Ready => Reservation::Ready(existing),
                    _ => Reservation::Busy(node.subscribe()),
                });
            }
        }

        let id = state.tree.insert(spec.clone(), parent);
        let path = match state.tree.get(id) {
            Some(node) => {
                node.set_state(ResourceState::Creating);
                node.path.clone()
            }
            None => return Err(Error::UnknownResource(id)),
        };
        state.registry.register(id, path.clone());
        Ok(Reservation::New {
            id,
            path,
            parent: parent_remote,
        })
    }

    /// Create `spec` under `parent` (or as a root) and wait until it is ready.
    ///
    /// A live sibling with the same name and specification is returned as is.
    pub(crate) async fn create_node(
        &self,
        spec: ResourceSpec,
        parent: Option<ResourceId>,
        timeout: Option<Duration>,
    ) -> Result<Resource> {
        spec.validate()?;

        let (id, path, parent_remote) = loop {
            match self.reserve(&spec, parent)? {
                Reservation::Ready(id) => {
                    debug!(resource = %id, "Reusing existing resource");
                    return Ok(Resource::new(id, self.clone()));
                }
                Reservation::Busy(rx) => settled(rx).await,
                Reservation::New { id, path, parent } => break (id, path, parent),
            }
        };

        let guard = CreationGuard::new(self, id);
        let mut policy = self.inner.config.policy(spec.kind()).create;
        if let Some(timeout) = timeout {
            policy.timeout = timeout;
        }

        info!(resource = %path, timeout_secs = policy.timeout.as_secs(), "Creating resource");
        let outcome = self
            .await_creation(id, &path, &spec, parent_remote.as_ref(), &policy)
            .await;

        let result = match outcome {
            PollOutcome::Done(handle) => self.finish_creation(id, parent, &spec, path, handle).await,
            PollOutcome::Failed(detail) => Err(self
                .fail_creation(id, Error::CreationError {
                    resource: path,
                    detail,
                })
                .await),
            PollOutcome::TimedOut { attempts } => Err(self
                .fail_creation(id, Error::CreationTimeout {
                    resource: path,
                    timeout: policy.timeout,
                    attempts,
                })
                .await),
            PollOutcome::Cancelled => Err(self.fail_creation(id, Error::Aborted).await),
        };
        guard.disarm();
        result
    }

    /// Mark a node whose remote object came up `Ready`, unless its parent
    /// stopped being ready meanwhile. Then the new object is deleted before the
    /// node fails, so the parent's cascade never outruns it.
    async fn finish_creation(
        &self,
        id: ResourceId,
        parent: Option<ResourceId>,
        spec: &ResourceSpec,
        path: ResourcePath,
        handle: RemoteHandle,
    ) -> Result<Resource> {
        let orphaned = {
            let mut state = self.lock();
            let orphaned = parent
                .and_then(|p| state.tree.get(p))
                .filter(|p| p.state() != ResourceState::Ready)
                .map(|p| (p.path.clone(), p.state()));
            if orphaned.is_none() {
                if let Some(node) = state.tree.get_mut(id) {
                    node.pending_target = None;
                    node.remote_handle = Some(handle.clone());
                    node.set_state(ResourceState::Ready);
                }
            }
            orphaned
        };

        let Some((parent_path, parent_state)) = orphaned else {
            info!(resource = %path, remote = %handle, "Resource ready");
            return Ok(Resource::new(id, self.clone()));
        };

        warn!(
            resource = %path,
            parent = %parent_path,
            parent_state = %parent_state,
            "Parent is no longer ready, deleting new resource"
        );
        if let Err(e) = self.delete_remote(spec.kind(), &path, &handle).await {
            warn!(resource = %path, error = %e, "Could not delete resource of departed parent");
        }
        self.forget_creation(id);
        Err(Error::InvalidParentState {
            resource: parent_path,
            state: parent_state,
        })
    }

    /// Track an object that already exists remotely under `handle`, waiting
    /// until it reports running. Nothing is submitted, and nothing is deleted
    /// if the object never comes up.
    pub(crate) async fn adopt_node(
        &self,
        spec: ResourceSpec,
        parent: Option<ResourceId>,
        handle: RemoteHandle,
    ) -> Result<Resource> {
        spec.validate()?;

        let (id, path) = loop {
            match self.reserve(&spec, parent)? {
                Reservation::Ready(id) => return Ok(Resource::new(id, self.clone())),
                Reservation::Busy(rx) => settled(rx).await,
                Reservation::New { id, path, .. } => break (id, path),
            }
        };

        let guard = CreationGuard::new(self, id);
        let policy = self.inner.config.policy(spec.kind()).create;
        info!(resource = %path, remote = %handle, "Adopting existing resource");
        let result = match self.await_running(&path, &handle, &policy).await {
            PollOutcome::Done(()) => {
                if let Some(node) = self.lock().tree.get_mut(id) {
                    node.remote_handle = Some(handle);
                    node.set_state(ResourceState::Ready);
                }
                Ok(Resource::new(id, self.clone()))
            }
            PollOutcome::Failed(detail) => Err(self
                .fail_creation(id, Error::CreationError {
                    resource: path,
                    detail,
                })
                .await),
            PollOutcome::TimedOut { attempts } => Err(self
                .fail_creation(id, Error::CreationTimeout {
                    resource: path,
                    timeout: policy.timeout,
                    attempts,
                })
                .await),
            PollOutcome::Cancelled => Err(self.fail_creation(id, Error::Aborted).await),
        };
        guard.disarm();
        result
    }

    /// Submit the create and poll until the remote object is up. Submission
    /// and polling share one deadline.
    async fn await_creation(
        &self,
        id: ResourceId,
        path: &ResourcePath,
        spec: &ResourceSpec,
        parent: Option<&RemoteHandle>,
        policy: &PollPolicy,
    ) -> PollOutcome<RemoteHandle> {
        let deadline = deadline_after(policy.timeout);
        let cancel = Some(&self.inner.cancel);
        let control_plane = self.inner.control_plane.as_ref();

        let submitted = poll_until(policy, cancel, path, move || async move {
            match control_plane
                .submit_create(CreateRequest { spec, parent })
                .await
            {
                Ok(submission) => Step::Done(submission),
                Err(e) => retry_or_fail(path, e),
            }
        })
        .await;
        let submission = match submitted {
            PollOutcome::Done(submission) => submission,
            PollOutcome::Failed(detail) => return PollOutcome::Failed(detail),
            PollOutcome::TimedOut { attempts } => return PollOutcome::TimedOut { attempts },
            PollOutcome::Cancelled => return PollOutcome::Cancelled,
        };

        let target = match &submission {
            Submission::Started(op) => op.target.clone(),
            Submission::Exists(handle) => {
                info!(resource = %path, remote = %handle, "Already exists, attaching");
                handle.clone()
            }
        };
        if let Some(node) = self.lock().tree.get_mut(id) {
            node.pending_target = Some(target.clone());
        }

        let policy = remaining(policy, deadline);
        let outcome = match &submission {
            Submission::Started(op) => self.await_operation(path, op, &policy).await,
            Submission::Exists(handle) => self.await_running(path, handle, &policy).await,
        };
        match outcome {
            PollOutcome::Done(()) => PollOutcome::Done(target),
            PollOutcome::Failed(detail) => PollOutcome::Failed(detail),
            PollOutcome::TimedOut { attempts } => PollOutcome::TimedOut {
                attempts: attempts + 1,
            },
            PollOutcome::Cancelled => PollOutcome::Cancelled,
        }
    }

    async fn await_operation(
        &self,
        path: &ResourcePath,
        operation: &OperationHandle,
        policy: &PollPolicy,
    ) -> PollOutcome<()> {
        let control_plane = self.inner.control_plane.as_ref();
        poll_until(policy, Some(&self.inner.cancel), path, move || async move {
            match control_plane.poll_operation(operation).await {
                Ok(OperationStatus::Ready) => Step::Done(()),
                Ok(OperationStatus::Pending) => Step::Continue,
                Ok(OperationStatus::Error(detail)) => Step::Fail(detail),
                Err(e) => retry_or_fail(path, e),
            }
        })
        .await
    }

    async fn await_running(
        &self,
        path: &ResourcePath,
        handle: &RemoteHandle,
        policy: &PollPolicy,
    ) -> PollOutcome<()> {
        let control_plane = self.inner.control_plane.as_ref();
        poll_until(policy, Some(&self.inner.cancel), path, move || async move {
            match control_plane.get_status(handle).await {
                Ok(LiveStatus::Running) => Step::Done(()),
                Ok(LiveStatus::Provisioning) => Step::Continue,
                Ok(LiveStatus::Stopping) => Step::Fail(format!("{handle} is being deleted")),
                Ok(LiveStatus::Error(detail)) => Step::Fail(detail),
                Ok(LiveStatus::Gone) => Step::Fail(format!("{handle} disappeared")),
                Err(e) => retry_or_fail(path, e),
            }
        })
        .await
    }

    /// Mark a `Creating` node `Failed` and unlink it. Returns what was
    /// submitted for it; `None` once the node has settled.
    fn forget_creation(&self, id: ResourceId) -> Option<(ResourceKind, RemoteHandle)> {
        let mut state = self.lock();
        let node = state.tree.get_mut(id)?;
        if node.state() != ResourceState::Creating {
            return None;
        }
        node.set_state(ResourceState::Failed);
        let target = node.pending_target.take().map(|t| (node.spec.kind(), t));
        state.registry.deregister(id);
        state.tree.detach(id);
        target
    }

    /// Abandon whatever was submitted for a creating node, then fail it.
    ///
    /// The node stays `Creating` until the abandon delete returns, so a
    /// cascade or [`Manager::abort`] waiting on it also waits for the delete.
    async fn fail_creation(&self, id: ResourceId, error: Error) -> Error {
        warn!(resource = %id, error = %error, "Creation failed");
        let target = self.lock().tree.get(id).and_then(|node| {
            node.pending_target
                .clone()
                .map(|target| (node.spec.kind(), target))
        });
        if let Some((kind, target)) = target {
            self.abandon_remote(kind, &target).await;
        }
        self.forget_creation(id);
        error
    }

    /// Best-effort delete of a half-created object, bounded by the kind's
    /// teardown budget.
    pub(crate) async fn abandon_remote(&self, kind: ResourceKind, target: &RemoteHandle) {
        let budget = self.inner.config.policy(kind).teardown.timeout;
        let delete = self.inner.control_plane.submit_delete(target);
        match tokio::time::timeout_at(deadline_after(budget), delete).await {
            Ok(Ok(_) | Err(RemoteError::NotFound(_))) => {
                info!(remote = %target, "Abandoned half-created resource, delete submitted");
            }
            Ok(Err(e)) => {
                warn!(remote = %target, error = %e, "Could not delete abandoned resource");
            }
            Err(_) => {
                warn!(
                    remote = %target,
                    timeout_secs = budget.as_secs(),
                    "Delete of abandoned resource timed out"
                );
            }
        }
    }

    /// Decide under the lock what a destroy cascade does with `id` right now.
    fn visit(&self, id: ResourceId, mode: Teardown) -> Visit {
        let state = self.lock();
        let Some(node) = state.tree.get(id) else {
            return Visit::Done;
        };
        match node.state() {
            ResourceState::Destroyed | ResourceState::Failed => Visit::Done,
            ResourceState::Ready if mode == Teardown::SkipRetained && node.retained => {
                info!(resource = %node.path, "Keeping retained resource");
                Visit::Children(node.children.clone())
            }
            ResourceState::Ready => {
                node.set_state(ResourceState::Destroying);
                Visit::Destroy {
                    kind: node.spec.kind(),
                    path: node.path.clone(),
                    children: node.children.clone(),
                    handle: node.remote_handle.clone(),
                }
            }
            ResourceState::Pending | ResourceState::Creating | ResourceState::Destroying => {
                Visit::Wait(node.subscribe())
            }
        }
    }

    /// Run a destroy cascade on its own tracked task.
    ///
    /// Dropping the caller does not stop the cascade, so nodes never stay
    /// `Destroying` and [`Manager::abort`] can wait for them.
    pub(crate) async fn teardown(&self, id: ResourceId, mode: Teardown) -> TeardownErrors {
        let manager = self.clone();
        let task = self
            .inner
            .tasks
            .spawn(async move { manager.destroy_node(id, mode).await });
        match task.await {
            Ok(errors) => errors,
            Err(e) => {
                let mut errors = TeardownErrors::default();
                let resource = self.lock().tree.get(id).map(|node| node.path.clone());
                if let Some(resource) = resource {
                    errors.push(Error::TeardownError {
                        resource,
                        detail: format!("teardown task failed: {e}"),
                    });
                }
                errors
            }
        }
    }

    /// Destroy `id` and everything below it, children newest first.
    ///
    /// Every node is attempted even when siblings or children fail; all
    /// failures are returned together.
    pub(crate) fn destroy_node(
        &self,
        id: ResourceId,
        mode: Teardown,
    ) -> BoxFuture<'_, TeardownErrors> {
        async move {
            let mut errors = TeardownErrors::default();

            let (kind, path, children, handle) = loop {
                match self.visit(id, mode) {
                    Visit::Done => return errors,
                    Visit::Wait(rx) => settled(rx).await,
                    Visit::Children(children) => {
                        for child in children.into_iter().rev() {
                            errors.extend(self.destroy_node(child, mode).await);
                        }
                        return errors;
                    }
                    Visit::Destroy {
                        kind,
                        path,
                        children,
                        handle,
                    } => break (kind, path, children, handle),
                }
            };

            info!(resource = %path, children = children.len(), "Destroying resource");
            for child in children.into_iter().rev() {
                errors.extend(self.destroy_node(child, Teardown::Full).await);
            }

            let result = match handle {
                Some(handle) => self.delete_remote(kind, &path, &handle).await,
                None => Ok(()),
            };

            {
                let mut state = self.lock();
                state.registry.deregister(id);
                state.tree.detach(id);
                if let Some(node) = state.tree.get(id) {
                    node.set_state(if result.is_ok() {
                        ResourceState::Destroyed
                    } else {
                        ResourceState::Failed
                    });
                }
            }

            match result {
                Ok(()) => info!(resource = %path, "Resource destroyed"),
                Err(e) => {
                    warn!(resource = %path, error = %e, "Teardown failed");
                    errors.push(e);
                }
            }
            errors
        }
        .boxed()
    }

    /// Submit the remote delete and wait until the object is gone.
    async fn delete_remote(
        &self,
        kind: ResourceKind,
        path: &ResourcePath,
        handle: &RemoteHandle,
    ) -> Result<()> {
        let policy = self.inner.config.policy(kind).teardown;
        let deadline = deadline_after(policy.timeout);
        let control_plane = self.inner.control_plane.as_ref();

        let submitted = poll_until(&policy, None, path, move || async move {
            match control_plane.submit_delete(handle).await {
                Ok(operation) => Step::Done(Some(operation)),
                Err(RemoteError::NotFound(_)) => Step::Done(None),
                Err(e) => retry_or_fail(path, e),
            }
        })
        .await;

        let outcome = match submitted {
            PollOutcome::Done(None) => {
                debug!(resource = %path, "Already gone");
                PollOutcome::Done(())
            }
            PollOutcome::Done(Some(operation)) => {
                debug!(resource = %path, operation = %operation.id, "Delete submitted");
                let policy = remaining(&policy, deadline);
                poll_until(&policy, None, path, move || async move {
                    match control_plane.get_status(handle).await {
                        Ok(LiveStatus::Gone) | Err(RemoteError::NotFound(_)) => Step::Done(()),
                        Ok(LiveStatus::Error(detail)) => Step::Fail(detail),
                        Ok(_) => Step::Continue,
                        Err(e) => retry_or_fail(path, e),
                    }
                })
                .await
            }
            PollOutcome::Failed(detail) => PollOutcome::Failed(detail),
            PollOutcome::TimedOut { attempts } => PollOutcome::TimedOut { attempts },
            PollOutcome::Cancelled => PollOutcome::Cancelled,
        };

        match outcome {
            PollOutcome::Done(()) => Ok(()),
            PollOutcome::Failed(detail) => Err(Error::TeardownError {
                resource: path.clone(),
                detail,
            }),
            PollOutcome::TimedOut { .. } => Err(Error::TeardownTimeout {
                resource: path.clone(),
                timeout: policy.timeout,
            }),
            PollOutcome::Cancelled => Err(Error::TeardownError {
                resource: path.clone(),
                detail: "teardown cancelled".to_string(),
            }),
        }
    }
}
