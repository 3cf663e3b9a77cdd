//! Resource specifications: what the caller wants to exist.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Longest resource name accepted (the GKE cluster-name limit).
pub const MAX_NAME_LEN: usize = 40;

/// The closed set of resource kinds the lifecycle manager knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A managed Kubernetes cluster. Always a root.
    Cluster,
    /// A named group of homogeneous (usually GPU) nodes inside a cluster.
    NodePool,
    /// A workload applied to a cluster or one of its node pools.
    Deployment,
}

impl ResourceKind {
    /// Whether a resource of this kind may live under `parent`.
    ///
    /// `None` means "as a root".
    #[must_use]
    pub fn accepts_parent(self, parent: Option<ResourceKind>) -> bool {
        matches!(
            (self, parent),
            (Self::Cluster, None)
                | (Self::NodePool, Some(Self::Cluster))
                | (Self::Deployment, Some(Self::Cluster | Self::NodePool))
        )
    }

    /// Path segment used when rendering a [`ResourcePath`](crate::ResourcePath).
    #[must_use]
    pub fn segment(self) -> &'static str {
        match self {
            Self::Cluster => "cluster",
            Self::NodePool => "nodePool",
            Self::Deployment => "deployment",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster => write!(f, "cluster"),
            Self::NodePool => write!(f, "node pool"),
            Self::Deployment => write!(f, "deployment"),
        }
    }
}

/// Immutable description of a desired resource.
///
/// `configuration` is opaque to the lifecycle manager; it is handed to the
/// control plane untouched. Two specs are "the same resource" when kind, name
/// and configuration are all equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSpec {
    kind: ResourceKind,
    name: String,
    #[serde(default)]
    configuration: Value,
}

impl ResourceSpec {
    /// Create a spec of any kind.
    pub fn new(kind: ResourceKind, name: impl Into<String>, configuration: Value) -> Self {
        Self {
            kind,
            name: name.into(),
            configuration,
        }
    }

    /// Spec for a cluster.
    pub fn cluster(name: impl Into<String>, configuration: Value) -> Self {
        Self::new(ResourceKind::Cluster, name, configuration)
    }

    /// Spec for a node pool.
    pub fn node_pool(name: impl Into<String>, configuration: Value) -> Self {
        Self::new(ResourceKind::NodePool, name, configuration)
    }

    /// Spec for a deployment.
    pub fn deployment(name: impl Into<String>, configuration: Value) -> Self {
        Self::new(ResourceKind::Deployment, name, configuration)
    }

    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn configuration(&self) -> &Value {
        &self.configuration
    }

    /// Local checks that never need the control plane.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] if the name is not an RFC 1123 label of
    /// at most [`MAX_NAME_LEN`] characters starting with a letter.
    pub fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        let invalid = |reason: &str| {
            Err(Error::Validation(format!(
                "invalid {} name '{name}': {reason}",
                self.kind
            )))
        };

        if name.is_empty() {
            return invalid("name is empty");
        }
        if name.len() > MAX_NAME_LEN {
            return invalid(&format!("longer than {MAX_NAME_LEN} characters"));
        }
        if !name.starts_with(|c: char| c.is_ascii_lowercase()) {
            return invalid("must start with a lowercase letter");
        }
        if name.ends_with('-') {
            return invalid("must not end with '-'");
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return invalid("only lowercase letters, digits and '-' are allowed");
        }
        Ok(())
    }
}
