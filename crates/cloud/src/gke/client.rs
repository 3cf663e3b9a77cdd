//! GKE control plane client.
//!
//! Clusters and node pools go through the GKE REST API. Deployments are
//! applied with the cluster's own Kubernetes API, reached through the
//! endpoint and CA that GKE reports for the cluster.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use lifecycle::{
    ControlPlane, CreateRequest, LiveStatus, Manifest, OperationHandle, OperationStatus,
    RemoteError, RemoteHandle, ResourceKind, ResourceSpec, Submission, WorkloadApplier,
};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::models::{
    ApiErrorResponse, ClusterListResponse, CreateClusterRequest, CreateNodePoolRequest,
    GkeCluster, NodePool, Operation,
};
use super::token::{TokenProvider, TokenSource};
use crate::error::CloudError;
use crate::manifest;
use crate::workloads::{DeploymentProgress, KubeWorkloads};

/// GKE API root.
pub const DEFAULT_BASE_URL: &str = "https://container.googleapis.com/v1";

/// Default timeout for API requests.
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Minimum spacing between GKE API calls.
const DEFAULT_THROTTLE: Duration = Duration::from_secs(1);

/// Operation ids for Kubernetes-side work carry this prefix.
const K8S_OPERATION_PREFIX: &str = "k8s:";

/// Spaces out requests so that at most one starts per interval.
struct Throttle {
    interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: Mutex::new(None),
        }
    }

    async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.interval).await;
        }
        *last = Some(Instant::now());
    }
}

/// What a remote handle points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target<'a> {
    Cluster(&'a str),
    NodePool(&'a str),
    Deployment {
        cluster: &'a str,
        namespace: &'a str,
        name: &'a str,
    },
}

fn parse_target(handle: &str) -> Target<'_> {
    if let Some((owner, rest)) = handle.split_once("/deployments/") {
        let (namespace, name) = rest.split_once('/').unwrap_or(("default", rest));
        return Target::Deployment {
            cluster: cluster_of(owner),
            namespace,
            name,
        };
    }
    if handle.contains("/nodePools/") {
        Target::NodePool(handle)
    } else {
        Target::Cluster(handle)
    }
}

/// Cluster part of a cluster or node pool handle.
fn cluster_of(handle: &str) -> &str {
    handle
        .split_once("/nodePools/")
        .map_or(handle, |(cluster, _)| cluster)
}

/// Map a GKE status string to a live status.
#[must_use]
pub fn live_status(status: &str, message: Option<&str>) -> LiveStatus {
    match status {
        "RUNNING" => LiveStatus::Running,
        "PROVISIONING" | "RECONCILING" | "STATUS_UNSPECIFIED" | "" => LiveStatus::Provisioning,
        "STOPPING" => LiveStatus::Stopping,
        other => LiveStatus::Error(match message {
            Some(message) if !message.is_empty() => format!("{other}: {message}"),
            _ => other.to_string(),
        }),
    }
}

/// Request body of a cluster or node pool: the configuration object plus the name.
fn definition(spec: &ResourceSpec) -> Result<Map<String, Value>, RemoteError> {
    let mut body = match spec.configuration() {
        Value::Object(map) => map.clone(),
        Value::Null => Map::new(),
        other => {
            return Err(RemoteError::Rejected(format!(
                "configuration of {} must be a JSON object, got {other}",
                spec.name()
            )))
        }
    };
    body.insert("name".to_string(), Value::String(spec.name().to_string()));
    Ok(body)
}

/// Configuration of a deployment resource.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DeploymentConfig {
    /// Inline YAML.
    manifest: Option<String>,
    /// URL to fetch the YAML from.
    url: Option<String>,
    namespace: String,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            manifest: None,
            url: None,
            namespace: "default".to_string(),
        }
    }
}

/// GKE control plane for one project and location.
pub struct Gke {
    http: Client,
    base_url: String,
    project: String,
    location: String,
    tokens: TokenProvider,
    throttle: Throttle,
    clusters: Mutex<HashMap<String, KubeWorkloads>>,
}

impl Gke {
    /// Create a client for clusters in `location` (zone or region) of `project`.
    ///
    /// # Errors
    /// Returns error if HTTP client cannot be created.
    pub fn new(
        project: impl Into<String>,
        location: impl Into<String>,
        tokens: TokenSource,
    ) -> Result<Self, CloudError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(CloudError::Http)?;

        Ok(Self {
            tokens: TokenProvider::new(tokens, http.clone()),
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            project: project.into(),
            location: location.into(),
            throttle: Throttle::new(DEFAULT_THROTTLE),
            clusters: Mutex::new(HashMap::new()),
        })
    }

    /// Point at another API root, e.g. a mock server.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Minimum spacing between API calls.
    #[must_use]
    pub fn with_throttle(mut self, interval: Duration) -> Self {
        self.throttle = Throttle::new(interval);
        self
    }

    #[must_use]
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// `projects/{project}/locations/{location}`.
    #[must_use]
    pub fn parent(&self) -> String {
        format!("projects/{}/locations/{}", self.project, self.location)
    }

    /// Remote handle of the cluster called `name`.
    #[must_use]
    pub fn cluster_handle(&self, name: &str) -> RemoteHandle {
        RemoteHandle::new(format!("{}/clusters/{name}", self.parent()))
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response, CloudError> {
        self.throttle.wait().await;
        let token = self.tokens.token().await?;
        let url = format!("{}/{path}", self.base_url);
        debug!(method = %method, url = %url, "GKE request");

        let mut request = self.http.request(method, &url).bearer_auth(token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.tokens.invalidate().await;
        }
        Ok(response)
    }

    /// Handle API response.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CloudError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                CloudError::Serialization(e)
            });
        }

        let message = serde_json::from_str::<ApiErrorResponse>(&text)
            .map(|e| match e.error.status {
                Some(code) => format!("{code}: {}", e.error.message),
                None => e.error.message,
            })
            .unwrap_or(text);
        Err(match status {
            StatusCode::NOT_FOUND => CloudError::NotFound(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CloudError::Auth(message),
            _ => CloudError::Api {
                status: status.as_u16(),
                message,
            },
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CloudError> {
        Self::handle_response(self.send(Method::GET, path, None).await?).await
    }

    /// Fetch a cluster by handle.
    ///
    /// # Errors
    /// [`CloudError::NotFound`] if it does not exist.
    pub async fn get_cluster(&self, handle: &RemoteHandle) -> Result<GkeCluster, CloudError> {
        self.get(handle.as_str()).await
    }

    /// Fetch a node pool by handle.
    ///
    /// # Errors
    /// [`CloudError::NotFound`] if it does not exist.
    pub async fn get_node_pool(&self, handle: &RemoteHandle) -> Result<NodePool, CloudError> {
        self.get(handle.as_str()).await
    }

    /// Clusters in this project and location.
    ///
    /// # Errors
    /// API errors.
    pub async fn list_clusters(&self) -> Result<Vec<GkeCluster>, CloudError> {
        let response: ClusterListResponse =
            self.get(&format!("{}/clusters", self.parent())).await?;
        Ok(response.clusters)
    }

    async fn get_operation(&self, id: &str) -> Result<Operation, CloudError> {
        self.get(id).await
    }

    /// Kubernetes client for a cluster, cached per cluster.
    ///
    /// # Errors
    /// [`CloudError::NotFound`] if the cluster is gone, [`CloudError::Config`]
    /// if it has no endpoint yet.
    pub async fn workloads(&self, cluster: &str) -> Result<KubeWorkloads, CloudError> {
        if let Some(workloads) = self.clusters.lock().await.get(cluster) {
            return Ok(workloads.clone());
        }

        let info = self.get_cluster(&RemoteHandle::new(cluster)).await?;
        let endpoint = info
            .endpoint
            .ok_or_else(|| CloudError::Config(format!("{cluster} has no endpoint")))?;
        let ca = info
            .master_auth
            .and_then(|auth| auth.cluster_ca_certificate)
            .ok_or_else(|| CloudError::Config(format!("{cluster} has no CA certificate")))?;
        let token = self.tokens.token().await?;
        let workloads = KubeWorkloads::connect(&endpoint, &ca, &token).await?;

        self.clusters
            .lock()
            .await
            .insert(cluster.to_string(), workloads.clone());
        Ok(workloads)
    }

    /// Turn a Kubernetes-side failure into a remote error, dropping cached
    /// credentials the API server no longer accepts.
    async fn k8s_error(&self, cluster: &str, error: CloudError) -> RemoteError {
        if error.is_unauthorized() {
            warn!(cluster = %cluster, "Kubernetes credentials rejected, reconnecting on next call");
            self.clusters.lock().await.remove(cluster);
            self.tokens.invalidate().await;
            return RemoteError::Transport(error.to_string());
        }
        error.into()
    }

    /// Install NVIDIA drivers on the GPU nodes of `cluster`.
    ///
    /// # Errors
    /// Connection, apply and wait errors.
    pub async fn install_gpu_drivers(
        &self,
        cluster: &RemoteHandle,
        timeout: Duration,
    ) -> Result<(), CloudError> {
        let workloads = self.workloads(cluster_of(cluster.as_str())).await?;
        info!(cluster = %cluster, "Installing NVIDIA drivers");
        workloads.install_gpu_drivers(&self.http, timeout).await
    }

    async fn submit_gke_create(
        &self,
        path: &str,
        body: &Value,
        target: String,
    ) -> Result<Submission, RemoteError> {
        let response = self.send(Method::POST, path, Some(body)).await?;
        if response.status() == StatusCode::CONFLICT {
            debug!(target = %target, "Already exists");
            return Ok(Submission::Exists(RemoteHandle::new(target)));
        }
        let operation: Operation = Self::handle_response(response).await?;
        info!(target = %target, operation = %operation.name, "Create submitted");
        Ok(Submission::Started(OperationHandle {
            id: format!("{}/operations/{}", self.parent(), operation.name),
            target: RemoteHandle::new(target),
        }))
    }

    async fn submit_deployment(
        &self,
        spec: &ResourceSpec,
        parent: &RemoteHandle,
    ) -> Result<Submission, RemoteError> {
        let config: DeploymentConfig = serde_json::from_value(spec.configuration().clone())
            .map_err(|e| RemoteError::Rejected(format!("invalid deployment configuration: {e}")))?;
        let manifest = match (config.manifest, config.url) {
            (Some(yaml), None) => Manifest::new(spec.name(), yaml),
            (None, Some(url)) => manifest::fetch(&self.http, &url).await?,
            _ => {
                return Err(RemoteError::Rejected(
                    "deployment needs exactly one of 'manifest' or 'url'".to_string(),
                ))
            }
        };

        let cluster = cluster_of(parent.as_str());
        let workloads = match self.workloads(cluster).await {
            Ok(workloads) => workloads,
            Err(e) => return Err(self.k8s_error(cluster, e).await),
        };
        if let Err(e) = workloads.apply(&manifest).await {
            return Err(self.k8s_error(cluster, e).await);
        }

        let target = format!("{parent}/deployments/{}/{}", config.namespace, spec.name());
        Ok(Submission::Started(OperationHandle {
            id: format!("{K8S_OPERATION_PREFIX}{target}"),
            target: RemoteHandle::new(target),
        }))
    }

    async fn deployment_status(
        &self,
        cluster: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentProgress>, RemoteError> {
        let result = match self.workloads(cluster).await {
            Ok(workloads) => workloads.deployment_progress(namespace, name).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(progress) => Ok(progress),
            Err(e) => Err(self.k8s_error(cluster, e).await),
        }
    }
}

#[async_trait]
impl ControlPlane for Gke {
    async fn submit_create(&self, request: CreateRequest<'_>) -> Result<Submission, RemoteError> {
        let spec = request.spec;
        match spec.kind() {
            ResourceKind::Cluster => {
                let body = serde_json::to_value(CreateClusterRequest {
                    cluster: definition(spec)?,
                })
                .map_err(CloudError::from)?;
                let path = format!("{}/clusters", self.parent());
                let target = format!("{path}/{}", spec.name());
                self.submit_gke_create(&path, &body, target).await
            }
            ResourceKind::NodePool => {
                let cluster = request.parent.ok_or_else(|| {
                    RemoteError::Rejected(format!("node pool {} needs a cluster", spec.name()))
                })?;
                let body = serde_json::to_value(CreateNodePoolRequest {
                    node_pool: definition(spec)?,
                })
                .map_err(CloudError::from)?;
                let path = format!("{cluster}/nodePools");
                let target = format!("{path}/{}", spec.name());
                self.submit_gke_create(&path, &body, target).await
            }
            ResourceKind::Deployment => {
                let parent = request.parent.ok_or_else(|| {
                    RemoteError::Rejected(format!("deployment {} needs a cluster", spec.name()))
                })?;
                self.submit_deployment(spec, parent).await
            }
        }
    }

    async fn poll_operation(
        &self,
        operation: &OperationHandle,
    ) -> Result<OperationStatus, RemoteError> {
        if operation.id.starts_with(K8S_OPERATION_PREFIX) {
            return Ok(match self.get_status(&operation.target).await? {
                LiveStatus::Running => OperationStatus::Ready,
                LiveStatus::Error(detail) => OperationStatus::Error(detail),
                LiveStatus::Provisioning | LiveStatus::Stopping | LiveStatus::Gone => {
                    OperationStatus::Pending
                }
            });
        }

        let op = self.get_operation(&operation.id).await?;
        debug!(operation = %op.name, status = %op.status, "Polled operation");
        Ok(match op.failure() {
            Some(detail) => OperationStatus::Error(detail),
            None if op.is_done() => OperationStatus::Ready,
            None => OperationStatus::Pending,
        })
    }

    async fn submit_delete(&self, handle: &RemoteHandle) -> Result<OperationHandle, RemoteError> {
        if let Target::Deployment {
            cluster,
            namespace,
            name,
        } = parse_target(handle.as_str())
        {
            let result = match self.workloads(cluster).await {
                Ok(workloads) => workloads.delete_deployment(namespace, name).await,
                Err(e) => Err(e),
            };
            return match result {
                Ok(true) => Ok(OperationHandle {
                    id: format!("{K8S_OPERATION_PREFIX}{handle}"),
                    target: handle.clone(),
                }),
                Ok(false) => Err(RemoteError::NotFound(handle.to_string())),
                Err(e) => Err(self.k8s_error(cluster, e).await),
            };
        }

        let response = self.send(Method::DELETE, handle.as_str(), None).await?;
        match response.status() {
            // GKE answers 400 (FAILED_PRECONDITION) or 409 (ABORTED) while another
            // operation runs on the object.
            StatusCode::BAD_REQUEST | StatusCode::CONFLICT => {
                let text = response.text().await.unwrap_or_default();
                return Err(RemoteError::Busy(format!("{handle}: {text}")));
            }
            StatusCode::NOT_FOUND => return Err(RemoteError::NotFound(handle.to_string())),
            _ => {}
        }
        let operation: Operation = Self::handle_response(response).await?;
        info!(target = %handle, operation = %operation.name, "Delete submitted");
        Ok(OperationHandle {
            id: format!("{}/operations/{}", self.parent(), operation.name),
            target: handle.clone(),
        })
    }

    async fn get_status(&self, handle: &RemoteHandle) -> Result<LiveStatus, RemoteError> {
        let (status, message) = match parse_target(handle.as_str()) {
            Target::Deployment {
                cluster,
                namespace,
                name,
            } => {
                return Ok(match self.deployment_status(cluster, namespace, name).await {
                    Ok(Some(DeploymentProgress::Available)) => LiveStatus::Running,
                    Ok(Some(DeploymentProgress::Progressing)) => LiveStatus::Provisioning,
                    Ok(Some(DeploymentProgress::NoAvailability)) => LiveStatus::Error(format!(
                        "{namespace}/{name} reports no Available condition"
                    )),
                    Ok(Some(DeploymentProgress::Stalled(reason))) => LiveStatus::Error(reason),
                    Ok(None) | Err(RemoteError::NotFound(_)) => LiveStatus::Gone,
                    Err(e) => return Err(e),
                });
            }
            Target::Cluster(_) => match self.get_cluster(handle).await {
                Ok(cluster) => (cluster.status, cluster.status_message),
                Err(e) if e.is_not_found() => return Ok(LiveStatus::Gone),
                Err(e) => return Err(e.into()),
            },
            Target::NodePool(_) => match self.get_node_pool(handle).await {
                Ok(pool) => (pool.status.unwrap_or_default(), pool.status_message),
                Err(e) if e.is_not_found() => return Ok(LiveStatus::Gone),
                Err(e) => return Err(e.into()),
            },
        };
        Ok(live_status(&status, message.as_deref()))
    }
}

#[async_trait]
impl WorkloadApplier for Gke {
    async fn deploy(&self, cluster: &RemoteHandle, manifest: &Manifest) -> Result<(), RemoteError> {
        let cluster = cluster_of(cluster.as_str());
        let result = match self.workloads(cluster).await {
            Ok(workloads) => workloads.apply(manifest).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(applied) => {
                info!(cluster = %cluster, manifest = %manifest.name(), objects = applied.len(), "Manifest applied");
                Ok(())
            }
            Err(e) => Err(self.k8s_error(cluster, e).await),
        }
    }
}
