//! Create/destroy behaviour of resource trees against an in-memory control plane.

mod common;

use common::{manager, Call, FakeControlPlane, Script};
use lifecycle::{
    ControlPlane, Error, RemoteHandle, ResourceKind, ResourcePath, ResourceSpec, ResourceState,
};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn cluster(name: &str) -> ResourceSpec {
    ResourceSpec::cluster(name, json!({"location": "us-central1-a"}))
}

fn pool(name: &str) -> ResourceSpec {
    ResourceSpec::node_pool(name, json!({"machineType": "n1-standard-4"}))
}

// =============================================================================
// Symmetry and ordering
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_every_created_resource_is_deleted_once() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    let c1 = manager.create(cluster("c1")).await.unwrap();
    let np1 = c1.create_child(pool("np1")).await.unwrap();
    let d1 = np1
        .create_child(ResourceSpec::deployment("triton", json!({})))
        .await
        .unwrap();
    assert_eq!(manager.active().len(), 3);

    c1.destroy().await.unwrap();

    assert_eq!(
        fake.calls(),
        vec![
            Call::Create("c1".into()),
            Call::Create("c1/np1".into()),
            Call::Create("c1/np1/triton".into()),
            Call::Delete("c1/np1/triton".into()),
            Call::Delete("c1/np1".into()),
            Call::Delete("c1".into()),
        ]
    );
    assert!(fake.live().is_empty());
    assert!(manager.active().is_empty());
    for resource in [&c1, &np1, &d1] {
        assert_eq!(resource.state(), ResourceState::Destroyed);
        assert!(!manager.is_active(resource.id()));
    }
}

#[tokio::test(start_paused = true)]
async fn test_siblings_destroyed_newest_first() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    let c1 = manager.create(cluster("c1")).await.unwrap();
    for name in ["np-a", "np-b", "np-c"] {
        c1.create_child(pool(name)).await.unwrap();
    }
    let names: Vec<String> = c1.children().iter().map(lifecycle::Resource::name).collect();
    assert_eq!(names, vec!["np-a", "np-b", "np-c"]);

    c1.destroy().await.unwrap();

    assert_eq!(fake.deletes(), vec!["c1/np-c", "c1/np-b", "c1/np-a", "c1"]);
    assert!(c1.children().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_roots_and_paths() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    let c1 = manager.create(cluster("c1")).await.unwrap();
    let c2 = manager.create(cluster("c2")).await.unwrap();
    let np1 = c1.create_child(pool("np1")).await.unwrap();

    assert_eq!(manager.roots(), vec![c1.clone(), c2.clone()]);
    assert_eq!(np1.parent(), Some(c1.clone()));
    assert_eq!(
        np1.path(),
        Some(ResourcePath::root(ResourceKind::Cluster, "c1").child(ResourceKind::NodePool, "np1"))
    );
    assert_eq!(np1.remote_handle().unwrap().as_str(), "c1/np1");
    assert_eq!(manager.get(np1.id()).unwrap(), np1);

    c2.destroy().await.unwrap();
    assert_eq!(manager.roots(), vec![c1]);
}

// =============================================================================
// Idempotence
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_same_spec_returns_existing_resource() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    let first = manager.create(cluster("c1")).await.unwrap();
    let second = manager.create(cluster("c1")).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(fake.creates(), vec!["c1"]);
    assert_eq!(manager.active().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_creates_share_one_remote_create() {
    let fake = FakeControlPlane::new();
    fake.script(
        "c1",
        Script {
            create_latency: Some(Duration::from_secs(3)),
            pending_polls: 2,
            ..Script::default()
        },
    );
    let manager = manager(&fake);

    let (a, b) = tokio::join!(manager.create(cluster("c1")), manager.create(cluster("c1")));

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(fake.submit_creates.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_same_name_different_configuration_rejected() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    manager.create(cluster("c1")).await.unwrap();
    let err = manager
        .create(ResourceSpec::cluster("c1", json!({"location": "europe-west4-a"})))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Validation(_)), "{err}");
    assert_eq!(fake.creates(), vec!["c1"]);
}

#[tokio::test(start_paused = true)]
async fn test_same_name_under_different_parents_is_allowed() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    let c1 = manager.create(cluster("c1")).await.unwrap();
    let c2 = manager.create(cluster("c2")).await.unwrap();
    let a = c1.create_child(pool("gpu")).await.unwrap();
    let b = c2.create_child(pool("gpu")).await.unwrap();

    assert_ne!(a, b);
    assert_eq!(fake.creates(), vec!["c1", "c2", "c1/gpu", "c2/gpu"]);
}

#[tokio::test(start_paused = true)]
async fn test_double_destroy_is_noop() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    let c1 = manager.create(cluster("c1")).await.unwrap();
    c1.destroy().await.unwrap();
    c1.destroy().await.unwrap();

    assert_eq!(fake.deletes(), vec!["c1"]);
    assert_eq!(fake.delete_attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_name_reusable_after_destroy() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    let first = manager.create(cluster("c1")).await.unwrap();
    first.destroy().await.unwrap();
    let second = manager.create(cluster("c1")).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(second.state(), ResourceState::Ready);
    assert_eq!(fake.creates(), vec!["c1", "c1"]);
}

// =============================================================================
// Local validation
// =============================================================================

#[tokio::test]
async fn test_validation_happens_before_any_remote_call() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    for spec in [
        ResourceSpec::cluster("Bad_Name", json!({})),
        ResourceSpec::cluster("", json!({})),
        pool("np1"),
        ResourceSpec::deployment("d1", json!({})),
    ] {
        let err = manager.create(spec).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{err}");
    }

    assert_eq!(fake.submit_creates.load(Ordering::SeqCst), 0);
    assert!(manager.active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_kind_must_fit_parent() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    let c1 = manager.create(cluster("c1")).await.unwrap();
    let np1 = c1.create_child(pool("np1")).await.unwrap();

    let err = c1.create_child(cluster("nested")).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = np1.create_child(pool("np2")).await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    assert_eq!(fake.creates(), vec!["c1", "c1/np1"]);
}

#[tokio::test(start_paused = true)]
async fn test_child_requires_ready_parent() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    let c1 = manager.create(cluster("c1")).await.unwrap();
    c1.destroy().await.unwrap();

    let err = c1.create_child(pool("np1")).await.unwrap_err();
    match err {
        Error::InvalidParentState { resource, state } => {
            assert_eq!(resource.to_string(), "cluster/c1");
            assert_eq!(state, ResourceState::Destroyed);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fake.creates(), vec!["c1"]);
}

// =============================================================================
// Remote behaviours
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_existing_remote_object_is_adopted() {
    let fake = FakeControlPlane::new();
    fake.script(
        "c1",
        Script {
            already_exists: true,
            ..Script::default()
        },
    );
    let manager = manager(&fake);

    let c1 = manager.create(cluster("c1")).await.unwrap();

    assert_eq!(c1.state(), ResourceState::Ready);
    assert_eq!(c1.remote_handle().unwrap().as_str(), "c1");
    assert!(fake.creates().is_empty());
    assert!(fake.status_polls.load(Ordering::SeqCst) >= 1);

    c1.destroy().await.unwrap();
    assert_eq!(fake.deletes(), vec!["c1"]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_creation_is_polled_until_ready() {
    let fake = FakeControlPlane::new();
    fake.script(
        "c1",
        Script {
            pending_polls: 5,
            ..Script::default()
        },
    );
    let manager = manager(&fake);
    let start = tokio::time::Instant::now();

    let c1 = manager.create(cluster("c1")).await.unwrap();

    assert_eq!(c1.state(), ResourceState::Ready);
    // 2 + 4 + 8 + 16 + 30 seconds of backoff before the sixth poll.
    assert_eq!(start.elapsed(), Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_busy_delete_is_retried() {
    let fake = FakeControlPlane::new();
    fake.script(
        "np1",
        Script {
            busy_deletes: 3,
            ..Script::default()
        },
    );
    let manager = manager(&fake);

    let c1 = manager.create(cluster("c1")).await.unwrap();
    c1.create_child(pool("np1")).await.unwrap();
    c1.destroy().await.unwrap();

    assert_eq!(fake.deletes(), vec!["c1/np1", "c1"]);
    assert_eq!(fake.delete_attempts.load(Ordering::SeqCst), 5);
    assert!(fake.live().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_delete_of_vanished_object_counts_as_done() {
    let fake = FakeControlPlane::new();
    fake.script(
        "c1",
        Script {
            already_exists: true,
            ..Script::default()
        },
    );
    let manager = manager(&fake);
    let c1 = manager.create(cluster("c1")).await.unwrap();

    // Deleted out of band.
    fake.submit_delete(&c1.remote_handle().unwrap()).await.unwrap();
    assert!(fake.live().is_empty());

    c1.destroy().await.unwrap();
    assert_eq!(c1.state(), ResourceState::Destroyed);
    assert!(!manager.is_active(c1.id()));
}

#[tokio::test(start_paused = true)]
async fn test_adopted_root_is_torn_down_by_cascade() {
    let fake = FakeControlPlane::new();
    fake.seed("c1");
    let manager = manager(&fake);

    let c1 = manager
        .adopt(cluster("c1"), RemoteHandle::new("c1"))
        .await
        .unwrap();
    assert_eq!(c1.state(), ResourceState::Ready);
    assert!(manager.is_active(c1.id()));
    assert!(fake.creates().is_empty());

    c1.destroy().await.unwrap();
    assert_eq!(fake.deletes(), vec!["c1"]);
    assert!(fake.live().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_adopting_missing_object_fails_without_deleting() {
    let fake = FakeControlPlane::new();
    let manager = manager(&fake);

    let err = manager
        .adopt(cluster("c1"), RemoteHandle::new("c1"))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CreationError { .. }), "{err}");
    assert_eq!(fake.delete_attempts.load(Ordering::SeqCst), 0);
    assert!(manager.active().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_child_finishing_under_departing_parent_is_deleted() {
    let fake = FakeControlPlane::new();
    fake.script(
        "np1",
        Script {
            pending_polls: 5,
            ..Script::default()
        },
    );
    let manager = manager(&fake);
    let c1 = manager.create(cluster("c1")).await.unwrap();

    let creating = {
        let c1 = c1.clone();
        tokio::spawn(async move { c1.create_child(pool("np1")).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    let children = c1.children();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].state(), ResourceState::Creating);

    c1.destroy().await.unwrap();

    let err = creating.await.unwrap().unwrap_err();
    assert!(
        matches!(
            err,
            Error::InvalidParentState {
                state: ResourceState::Destroying,
                ..
            }
        ),
        "{err}"
    );
    assert_eq!(children[0].state(), ResourceState::Failed);
    assert_eq!(fake.deletes(), vec!["c1/np1", "c1"]);
    assert!(fake.live().is_empty());
    assert!(manager.active().is_empty());
}
