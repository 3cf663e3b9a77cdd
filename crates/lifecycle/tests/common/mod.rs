//! In-memory control plane and workload applier for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lifecycle::{
    ControlPlane, CreateRequest, LifecycleConfig, LiveStatus, Manager, Manifest, OperationHandle,
    OperationStatus, RemoteError, RemoteHandle, Submission, WorkloadApplier,
};

// =============================================================================
// Scripted behaviour
// =============================================================================

/// How the fake reacts to one resource name.
#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Polls answered `Pending` before the create operation completes.
    pub pending_polls: u32,
    /// The create operation never completes.
    pub never_ready: bool,
    /// The create operation ends in this error.
    pub fail_with: Option<String>,
    /// `submit_create` is refused outright.
    pub reject_create: Option<String>,
    /// The object already exists (and is running) before the first create.
    pub already_exists: bool,
    /// `submit_create` sleeps this long before answering.
    pub create_latency: Option<Duration>,
    /// Number of delete submissions answered `Busy`.
    pub busy_deletes: u32,
    /// `submit_delete` is refused outright.
    pub reject_delete: Option<String>,
    /// Deleted objects stay `Stopping` forever.
    pub never_gone: bool,
    /// `submit_delete` never answers.
    pub hang_deletes: bool,
}

/// A call that changed remote state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Create(String),
    Delete(String),
}

#[derive(Debug, Clone, PartialEq)]
enum ObjectStatus {
    Provisioning,
    Running,
    Stopping,
    Error(String),
}

#[derive(Debug)]
struct Operation {
    target: String,
    remaining: u32,
    delete: bool,
}

#[derive(Default)]
struct FakeState {
    scripts: HashMap<String, Script>,
    objects: HashMap<String, ObjectStatus>,
    operations: HashMap<String, Operation>,
    calls: Vec<Call>,
    next_op: u64,
}

// =============================================================================
// Fake control plane
// =============================================================================

/// Handles are `parent/name`, so `c1/np1` is node pool `np1` of cluster `c1`.
#[derive(Default)]
pub struct FakeControlPlane {
    state: Mutex<FakeState>,
    pub submit_creates: AtomicUsize,
    pub delete_attempts: AtomicUsize,
    pub status_polls: AtomicUsize,
}

fn name_of(handle: &str) -> &str {
    handle.rsplit('/').next().unwrap_or(handle)
}

impl FakeControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, name: &str, script: Script) {
        let mut state = self.state.lock().unwrap();
        if script.already_exists {
            state
                .objects
                .insert(name.to_string(), ObjectStatus::Running);
        }
        state.scripts.insert(name.to_string(), script);
    }

    /// Pre-create an object under an explicit handle.
    pub fn seed(&self, handle: &str) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(handle.to_string(), ObjectStatus::Running);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn creates(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create(h) => Some(h),
                Call::Delete(_) => None,
            })
            .collect()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Delete(h) => Some(h),
                Call::Create(_) => None,
            })
            .collect()
    }

    /// Objects that still exist remotely, sorted.
    pub fn live(&self) -> Vec<String> {
        let mut live: Vec<String> = self.state.lock().unwrap().objects.keys().cloned().collect();
        live.sort();
        live
    }

    fn next_operation(state: &mut FakeState, target: &str, remaining: u32, delete: bool) -> OperationHandle {
        state.next_op += 1;
        let id = format!("op-{}", state.next_op);
        state.operations.insert(
            id.clone(),
            Operation {
                target: target.to_string(),
                remaining,
                delete,
            },
        );
        OperationHandle {
            id,
            target: RemoteHandle::new(target),
        }
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn submit_create(&self, request: CreateRequest<'_>) -> Result<Submission, RemoteError> {
        self.submit_creates.fetch_add(1, Ordering::SeqCst);
        let name = request.spec.name();
        let latency = self
            .state
            .lock()
            .unwrap()
            .scripts
            .get(name)
            .and_then(|s| s.create_latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let handle = match request.parent {
            Some(parent) => format!("{parent}/{name}"),
            None => name.to_string(),
        };

        let mut state = self.state.lock().unwrap();
        let script = state.scripts.get(name).cloned().unwrap_or_default();
        if let Some(reason) = script.reject_create {
            return Err(RemoteError::Rejected(reason));
        }
        if state.objects.contains_key(&handle) {
            return Ok(Submission::Exists(RemoteHandle::new(handle)));
        }

        state.calls.push(Call::Create(handle.clone()));
        state
            .objects
            .insert(handle.clone(), ObjectStatus::Provisioning);
        let remaining = if script.never_ready {
            u32::MAX
        } else {
            script.pending_polls
        };
        Ok(Submission::Started(Self::next_operation(
            &mut state, &handle, remaining, false,
        )))
    }

    async fn poll_operation(
        &self,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, RemoteError> {
        let mut state = self.state.lock().unwrap();
        let Some(op) = state.operations.get_mut(&operation.id) else {
            return Err(RemoteError::NotFound(operation.id.clone()));
        };
        if op.delete {
            return Ok(OperationStatus::Ready);
        }
        if op.remaining > 0 {
            if op.remaining != u32::MAX {
                op.remaining -= 1;
            }
            return Ok(OperationStatus::Pending);
        }

        let target = op.target.clone();
        let failure = state
            .scripts
            .get(name_of(&target))
            .and_then(|s| s.fail_with.clone());
        match failure {
            Some(detail) => {
                if let Some(object) = state.objects.get_mut(&target) {
                    *object = ObjectStatus::Error(detail.clone());
                }
                Ok(OperationStatus::Error(detail))
            }
            None => {
                if let Some(object) = state.objects.get_mut(&target) {
                    *object = ObjectStatus::Running;
                }
                Ok(OperationStatus::Ready)
            }
        }
    }

    async fn submit_delete(&self, handle: &RemoteHandle) -> Result<OperationHandle, RemoteError> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        let name = name_of(handle.as_str()).to_string();
        let hang = self
            .state
            .lock()
            .unwrap()
            .scripts
            .get(&name)
            .is_some_and(|s| s.hang_deletes);
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();

        let mut never_gone = false;
        if let Some(script) = state.scripts.get_mut(&name) {
            if script.busy_deletes > 0 {
                script.busy_deletes -= 1;
                return Err(RemoteError::Busy(format!("{handle} has an operation running")));
            }
            if let Some(reason) = script.reject_delete.clone() {
                return Err(RemoteError::Rejected(reason));
            }
            never_gone = script.never_gone;
        }

        if !state.objects.contains_key(handle.as_str()) {
            return Err(RemoteError::NotFound(handle.to_string()));
        }
        state.calls.push(Call::Delete(handle.to_string()));
        if never_gone {
            state
                .objects
                .insert(handle.to_string(), ObjectStatus::Stopping);
        } else {
            state.objects.remove(handle.as_str());
        }
        Ok(Self::next_operation(&mut state, handle.as_str(), 0, true))
    }

    async fn get_status(&self, handle: &RemoteHandle) -> Result<LiveStatus, RemoteError> {
        self.status_polls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Ok(match state.objects.get(handle.as_str()) {
            None => LiveStatus::Gone,
            Some(ObjectStatus::Provisioning) => LiveStatus::Provisioning,
            Some(ObjectStatus::Running) => LiveStatus::Running,
            Some(ObjectStatus::Stopping) => LiveStatus::Stopping,
            Some(ObjectStatus::Error(detail)) => LiveStatus::Error(detail.clone()),
        })
    }
}

// =============================================================================
// Fake workload applier
// =============================================================================

#[derive(Default)]
pub struct RecordingApplier {
    pub applied: Mutex<Vec<(String, String)>>,
    pub fail: bool,
}

#[async_trait]
impl WorkloadApplier for RecordingApplier {
    async fn deploy(&self, cluster: &RemoteHandle, manifest: &Manifest) -> Result<(), RemoteError> {
        if self.fail {
            return Err(RemoteError::Rejected("admission webhook denied".to_string()));
        }
        self.applied
            .lock()
            .unwrap()
            .push((cluster.to_string(), manifest.name().to_string()));
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn manager(fake: &Arc<FakeControlPlane>) -> Manager {
    Manager::new(fake.clone(), LifecycleConfig::default())
}

pub fn manager_with(fake: &Arc<FakeControlPlane>, config: LifecycleConfig) -> Manager {
    Manager::new(fake.clone(), config)
}

/// Let paused time advance until `check` holds or a minute passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..60 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    check()
}
