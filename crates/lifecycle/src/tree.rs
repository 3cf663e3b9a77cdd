//! Arena holding every resource node of one manager, plus the active registry.
//!
//! Nodes refer to each other by [`ResourceId`]; parents own an ordered list
//! of child ids and children keep a non-owning parent id. Nodes are never
//! removed from the arena, so a handle can always read the final state of the
//! resource it names. Finished nodes are only unlinked from their parent.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tokio::sync::watch;

use crate::control_plane::RemoteHandle;
use crate::spec::{ResourceKind, ResourceSpec};
use crate::state::ResourceState;

/// Manager-unique identifier of a resource node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Human readable location of a resource, e.g. `cluster/c1/nodePool/np1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<(ResourceKind, String)>,
}

impl ResourcePath {
    pub fn root(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            segments: vec![(kind, name.into())],
        }
    }

    #[must_use]
    pub fn child(&self, kind: ResourceKind, name: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push((kind, name.into()));
        Self { segments }
    }

    /// Name of the last segment.
    #[must_use]
    pub fn name(&self) -> &str {
        self.segments.last().map_or("", |(_, name)| name.as_str())
    }

    /// Number of segments; roots have depth 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.segments.len()
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (kind, name)) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}/{name}", kind.segment())?;
        }
        Ok(())
    }
}

pub(crate) struct Node {
    pub spec: ResourceSpec,
    pub path: ResourcePath,
    pub parent: Option<ResourceId>,
    /// Live children in creation order.
    pub children: Vec<ResourceId>,
    pub remote_handle: Option<RemoteHandle>,
    /// Remote object submitted while still `Creating`.
    pub pending_target: Option<RemoteHandle>,
    /// Left alive on purpose by a `keep` scope.
    pub retained: bool,
    state: watch::Sender<ResourceState>,
}

impl Node {
    pub fn state(&self) -> ResourceState {
        *self.state.borrow()
    }

    /// Move to `next`, waking every waiter.
    ///
    /// Illegal transitions are ignored and reported as `false`.
    pub fn set_state(&self, next: ResourceState) -> bool {
        let current = self.state();
        if !current.can_transition_to(next) {
            tracing::warn!(
                resource = %self.path,
                from = %current,
                to = %next,
                "Ignoring illegal state transition"
            );
            return false;
        }
        self.state.send_replace(next);
        true
    }

    pub fn subscribe(&self) -> watch::Receiver<ResourceState> {
        self.state.subscribe()
    }
}

#[derive(Default)]
pub(crate) struct Tree {
    next_id: u64,
    nodes: HashMap<ResourceId, Node>,
    roots: Vec<ResourceId>,
}

impl Tree {
    /// Insert a `Pending` node and link it under `parent` (or as a root).
    ///
    /// The caller checks that `parent` exists.
    pub fn insert(&mut self, spec: ResourceSpec, parent: Option<ResourceId>) -> ResourceId {
        self.next_id += 1;
        let id = ResourceId(self.next_id);

        let path = match parent.and_then(|p| self.nodes.get(&p)) {
            Some(p) => p.path.child(spec.kind(), spec.name()),
            None => ResourcePath::root(spec.kind(), spec.name()),
        };

        let (state, _) = watch::channel(ResourceState::Pending);
        self.nodes.insert(
            id,
            Node {
                spec,
                path,
                parent,
                children: Vec::new(),
                remote_handle: None,
                pending_target: None,
                retained: false,
                state,
            },
        );

        match parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(p) => p.children.push(id),
            None => self.roots.push(id),
        }
        id
    }

    pub fn get(&self, id: ResourceId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: ResourceId) -> Option<&mut Node> {
        self.nodes.get_mut(&id)
    }

    pub fn roots(&self) -> &[ResourceId] {
        &self.roots
    }

    /// Live children of `parent`, or the live roots for `None`.
    pub fn siblings(&self, parent: Option<ResourceId>) -> &[ResourceId] {
        match parent {
            Some(p) => self.nodes.get(&p).map_or(&[], |n| n.children.as_slice()),
            None => &self.roots,
        }
    }

    /// Live node named `name` directly under `parent`.
    pub fn find(&self, parent: Option<ResourceId>, name: &str) -> Option<ResourceId> {
        self.siblings(parent)
            .iter()
            .copied()
            .find(|id| self.nodes.get(id).is_some_and(|n| n.spec.name() == name))
    }

    /// Unlink `id` from its parent's children (or from the roots).
    pub fn detach(&mut self, id: ResourceId) {
        let parent = self.nodes.get(&id).and_then(|n| n.parent);
        let list = match parent.and_then(|p| self.nodes.get_mut(&p)) {
            Some(p) => &mut p.children,
            None => &mut self.roots,
        };
        list.retain(|c| *c != id);
    }
}

/// Snapshot of one registered resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveResource {
    pub id: ResourceId,
    pub path: ResourcePath,
    pub state: ResourceState,
    pub remote_handle: Option<RemoteHandle>,
    /// Kept alive by a `keep` scope.
    pub retained: bool,
}

/// Resources that may still exist remotely: registered when creation is
/// submitted, deregistered once `Destroyed` or `Failed`.
#[derive(Default)]
pub(crate) struct Registry {
    entries: BTreeMap<ResourceId, ResourcePath>,
}

impl Registry {
    pub fn register(&mut self, id: ResourceId, path: ResourcePath) {
        self.entries.insert(id, path);
    }

    pub fn deregister(&mut self, id: ResourceId) {
        self.entries.remove(&id);
    }

    pub fn contains(&self, id: ResourceId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.entries.keys().copied()
    }
}
