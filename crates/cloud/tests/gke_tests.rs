//! GKE control plane against a mock API server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cloud::{Gke, GpuNodePoolConfig, GpuType, TokenSource};
use lifecycle::{
    ControlPlane, CreateRequest, KindPolicy, LifecycleConfig, LiveStatus, Manager,
    OperationHandle, OperationStatus, PollPolicy, RemoteError, RemoteHandle, ResourceSpec,
    ResourceState, Submission,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const PARENT: &str = "/projects/gpu-lab/locations/us-central1-a";

fn gke(server: &MockServer) -> Gke {
    Gke::new("gpu-lab", "us-central1-a", TokenSource::Static("ya29.test".into()))
        .unwrap()
        .with_base_url(server.uri())
        .with_throttle(Duration::ZERO)
}

fn operation(name: &str, status: &str) -> serde_json::Value {
    json!({"name": name, "status": status, "operationType": "CREATE_CLUSTER"})
}

fn cluster_handle() -> RemoteHandle {
    RemoteHandle::new("projects/gpu-lab/locations/us-central1-a/clusters/c1")
}

// =============================================================================
// Create
// =============================================================================

#[tokio::test]
async fn test_create_cluster_posts_definition() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{PARENT}/clusters")))
        .and(header("Authorization", "Bearer ya29.test"))
        .and(body_partial_json(json!({
            "cluster": {"name": "c1", "initialNodeCount": 1}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("operation-1", "RUNNING")))
        .expect(1)
        .mount(&server)
        .await;

    let spec = ResourceSpec::cluster("c1", json!({"initialNodeCount": 1}));
    let submission = gke(&server)
        .submit_create(CreateRequest {
            spec: &spec,
            parent: None,
        })
        .await
        .unwrap();

    assert_eq!(
        submission,
        Submission::Started(OperationHandle {
            id: "projects/gpu-lab/locations/us-central1-a/operations/operation-1".to_string(),
            target: cluster_handle(),
        })
    );
}

#[tokio::test]
async fn test_create_conflict_attaches_to_existing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("{PARENT}/clusters/c1/nodePools")))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": {"code": 409, "message": "Already exists", "status": "ALREADY_EXISTS"}
        })))
        .mount(&server)
        .await;

    let spec = ResourceSpec::node_pool(
        "gpu",
        GpuNodePoolConfig::new(8, 1, GpuType::T4)
            .unwrap()
            .to_configuration(),
    );
    let parent = cluster_handle();
    let submission = gke(&server)
        .submit_create(CreateRequest {
            spec: &spec,
            parent: Some(&parent),
        })
        .await
        .unwrap();

    assert_eq!(
        submission,
        Submission::Exists(RemoteHandle::new(format!("{parent}/nodePools/gpu")))
    );
}

#[tokio::test]
async fn test_create_quota_error_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"code": 403, "message": "Quota 'NVIDIA_T4_GPUS' exceeded", "status": "PERMISSION_DENIED"}
        })))
        .mount(&server)
        .await;

    let spec = ResourceSpec::cluster("c1", json!({}));
    let err = gke(&server)
        .submit_create(CreateRequest {
            spec: &spec,
            parent: None,
        })
        .await
        .unwrap_err();

    match err {
        RemoteError::Rejected(detail) => assert!(detail.contains("NVIDIA_T4_GPUS"), "{detail}"),
        other => panic!("unexpected error: {other}"),
    }
}

// =============================================================================
// Operations and status
// =============================================================================

#[tokio::test]
async fn test_poll_operation_states() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{PARENT}/operations/op-pending")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("op-pending", "RUNNING")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{PARENT}/operations/op-done")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("op-done", "DONE")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{PARENT}/operations/op-failed")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "op-failed",
            "status": "DONE",
            "error": {"code": 8, "message": "ZONE_RESOURCE_POOL_EXHAUSTED"}
        })))
        .mount(&server)
        .await;

    let client = gke(&server);
    let op = |name: &str| OperationHandle {
        id: format!("projects/gpu-lab/locations/us-central1-a/operations/{name}"),
        target: cluster_handle(),
    };

    assert_eq!(
        client.poll_operation(&op("op-pending")).await.unwrap(),
        OperationStatus::Pending
    );
    assert_eq!(
        client.poll_operation(&op("op-done")).await.unwrap(),
        OperationStatus::Ready
    );
    assert_eq!(
        client.poll_operation(&op("op-failed")).await.unwrap(),
        OperationStatus::Error("ZONE_RESOURCE_POOL_EXHAUSTED".to_string())
    );
}

#[tokio::test]
async fn test_status_of_missing_cluster_is_gone() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{PARENT}/clusters/c1")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({
            "error": {"code": 404, "message": "Not found", "status": "NOT_FOUND"}
        })))
        .mount(&server)
        .await;

    let status = gke(&server).get_status(&cluster_handle()).await.unwrap();
    assert_eq!(status, LiveStatus::Gone);
}

#[tokio::test]
async fn test_status_of_degraded_node_pool() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{PARENT}/clusters/c1/nodePools/gpu")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "gpu",
            "status": "RUNNING_WITH_ERROR",
            "statusMessage": "1 node failed to register"
        })))
        .mount(&server)
        .await;

    let handle = RemoteHandle::new(format!("{}/nodePools/gpu", cluster_handle()));
    let status = gke(&server).get_status(&handle).await.unwrap();
    assert_eq!(
        status,
        LiveStatus::Error("RUNNING_WITH_ERROR: 1 node failed to register".to_string())
    );
}

// =============================================================================
// Delete
// =============================================================================

#[tokio::test]
async fn test_delete_while_busy_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("{PARENT}/clusters/c1")))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"code": 400, "message": "Operation operation-7 is currently creating node pool gpu", "status": "FAILED_PRECONDITION"}
        })))
        .mount(&server)
        .await;

    let err = gke(&server).submit_delete(&cluster_handle()).await.unwrap_err();
    assert!(matches!(err, RemoteError::Busy(_)), "{err}");
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_delete_conflicting_with_operation_is_transient() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path(format!("{PARENT}/clusters/c1/nodePools/gpu")))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "error": {"code": 409, "message": "Cluster is running incompatible operation operation-9", "status": "ABORTED"}
        })))
        .mount(&server)
        .await;

    let handle = RemoteHandle::new(format!("{}/nodePools/gpu", cluster_handle()));
    let err = gke(&server).submit_delete(&handle).await.unwrap_err();
    assert!(matches!(err, RemoteError::Busy(_)), "{err}");
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_delete_of_missing_cluster_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = gke(&server).submit_delete(&cluster_handle()).await.unwrap_err();
    assert!(matches!(err, RemoteError::NotFound(_)), "{err}");
}

#[tokio::test]
async fn test_server_errors_are_transient() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = gke(&server).get_status(&cluster_handle()).await.unwrap_err();
    assert!(err.is_transient(), "{err}");
}

// =============================================================================
// Through the manager
// =============================================================================

#[tokio::test]
async fn test_manager_creates_and_deletes_cluster() {
    let server = MockServer::start().await;
    let deleted = Arc::new(AtomicBool::new(false));
    let polls = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path(format!("{PARENT}/clusters")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("op-create", "RUNNING")))
        .expect(1)
        .mount(&server)
        .await;
    let op_polls = polls.clone();
    Mock::given(method("GET"))
        .and(path(format!("{PARENT}/operations/op-create")))
        .respond_with(move |_: &Request| {
            let status = if op_polls.fetch_add(1, Ordering::SeqCst) < 2 {
                "RUNNING"
            } else {
                "DONE"
            };
            ResponseTemplate::new(200).set_body_json(operation("op-create", status))
        })
        .mount(&server)
        .await;
    let on_delete = deleted.clone();
    Mock::given(method("DELETE"))
        .and(path(format!("{PARENT}/clusters/c1")))
        .respond_with(move |_: &Request| {
            on_delete.store(true, Ordering::SeqCst);
            ResponseTemplate::new(200).set_body_json(operation("op-delete", "RUNNING"))
        })
        .expect(1)
        .mount(&server)
        .await;
    let is_deleted = deleted.clone();
    Mock::given(method("GET"))
        .and(path(format!("{PARENT}/clusters/c1")))
        .respond_with(move |_: &Request| {
            if is_deleted.load(Ordering::SeqCst) {
                ResponseTemplate::new(404)
            } else {
                ResponseTemplate::new(200).set_body_json(json!({"name": "c1", "status": "RUNNING"}))
            }
        })
        .mount(&server)
        .await;

    let policy = PollPolicy::fixed(Duration::from_millis(10), Duration::from_secs(10));
    let manager = Manager::new(
        Arc::new(gke(&server)),
        LifecycleConfig::uniform(KindPolicy {
            create: policy,
            teardown: policy,
        }),
    );

    let c1 = manager
        .create(ResourceSpec::cluster("c1", json!({"initialNodeCount": 1})))
        .await
        .unwrap();
    assert_eq!(c1.state(), ResourceState::Ready);
    assert_eq!(c1.remote_handle(), Some(cluster_handle()));
    assert_eq!(polls.load(Ordering::SeqCst), 3);

    c1.destroy().await.unwrap();
    assert_eq!(c1.state(), ResourceState::Destroyed);
    assert!(deleted.load(Ordering::SeqCst));
}
