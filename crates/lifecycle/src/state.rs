//! Resource lifecycle states.

use serde::{Deserialize, Serialize};

/// Where a resource is in its lifecycle.
///
/// ```text
/// Pending ──► Creating ──► Ready ──► Destroying ──► Destroyed
///                 │                      │
///                 └──────► Failed ◄──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Accepted locally, nothing submitted yet.
    Pending,
    /// Submitted to the control plane, waiting for it to come up.
    Creating,
    /// Alive on the control plane.
    Ready,
    /// Children are being torn down or the remote delete is in flight.
    Destroying,
    /// Confirmed gone on the control plane.
    Destroyed,
    /// Creation or teardown failed permanently.
    Failed,
}

impl ResourceState {
    /// Whether `self → next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(self, next: ResourceState) -> bool {
        use ResourceState::{Creating, Destroyed, Destroying, Failed, Pending, Ready};
        matches!(
            (self, next),
            (Pending, Creating)
                | (Creating, Ready | Failed)
                | (Ready, Destroying)
                | (Destroying, Destroyed | Failed)
        )
    }

    /// No further transitions will happen.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed | Self::Failed)
    }

    /// No operation is in flight: terminal, or `Ready`.
    #[must_use]
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == Self::Ready
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Creating => write!(f, "creating"),
            Self::Ready => write!(f, "ready"),
            Self::Destroying => write!(f, "destroying"),
            Self::Destroyed => write!(f, "destroyed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
