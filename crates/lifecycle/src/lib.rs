//! Hierarchical lifecycle management for slow, eventually consistent cloud
//! resources.
//!
//! Resources form a strict tree: clusters are roots, node pools live under
//! clusters, deployments live under clusters or node pools. Every creation is
//! a remote operation that is submitted, then polled until ready within a
//! bounded budget. Teardown always runs children first, newest first, and
//! keeps going past individual failures.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use lifecycle::{ControlPlane, LifecycleConfig, Manager, ResourceSpec};
//! # async fn example(control_plane: Arc<dyn ControlPlane>) -> lifecycle::Result<()> {
//! let manager = Manager::new(control_plane, LifecycleConfig::default());
//! manager
//!     .manage(ResourceSpec::cluster("c1", serde_json::json!({})))
//!     .run(|cluster| async move {
//!         cluster
//!             .attach(ResourceSpec::node_pool("np1", serde_json::json!({})))
//!             .run(|_pool| async move { Ok::<_, lifecycle::Error>(()) })
//!             .await
//!     })
//!     .await
//! # }
//! ```

pub mod config;
pub mod control_plane;
pub mod error;
mod machine;
pub mod manager;
mod poll;
pub mod resource;
pub mod scope;
pub mod spec;
pub mod state;
pub mod tree;

pub use config::{KindPolicy, LifecycleConfig, PollPolicy};
pub use control_plane::{
    ControlPlane, CreateRequest, LiveStatus, Manifest, OperationHandle, OperationStatus,
    RemoteError, RemoteHandle, Submission, WorkloadApplier,
};
pub use error::{Error, Result, TeardownErrors};
pub use manager::Manager;
pub use resource::Resource;
pub use scope::{ScopeGuard, ScopedResourceContext};
pub use spec::{ResourceKind, ResourceSpec};
pub use state::ResourceState;
pub use tree::{ActiveResource, ResourceId, ResourcePath};
