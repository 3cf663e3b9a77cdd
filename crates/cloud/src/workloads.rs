//! Kubernetes workloads on a GKE cluster: applying manifests and waiting for
//! deployments, services and daemon sets.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::GroupVersionKind;
use kube::discovery::{pinned_kind, Scope};
use kube::{Client, Config};
use lifecycle::Manifest;
use serde::Deserialize;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::CloudError;

/// Field manager recorded on server-side applied objects.
pub const FIELD_MANAGER: &str = "gpu-lifecycle";

/// Daemon set manifest that installs NVIDIA drivers on Container-Optimized OS nodes.
pub const GPU_DRIVER_INSTALLER_URL: &str = "https://raw.githubusercontent.com/GoogleCloudPlatform/container-engine-accelerators/master/nvidia-driver-installer/cos/daemonset-preloaded.yaml";

/// Name of the daemon set created by the driver installer manifest.
pub const GPU_DRIVER_DAEMON_SET: &str = "nvidia-driver-installer";

/// Interval between readiness checks.
const POLL_INTERVAL_SECS: u64 = 5;

/// Clamp for wait budgets that would overflow the clock.
const MAX_WAIT: Duration = Duration::from_secs(86_400 * 365);

/// A deployment may report no `Available` condition for this long after creation.
const AVAILABILITY_GRACE_SECS: u64 = 10;

/// Progress of a deployment rollout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentProgress {
    /// `Available` is true.
    Available,
    /// Still rolling out.
    Progressing,
    /// `Available` never showed up.
    NoAvailability,
    /// `Progressing` went false; the rollout will not finish by itself.
    Stalled(String),
}

/// Client for one cluster's API server.
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
}

impl KubeWorkloads {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect to an API server at `endpoint` (host or `https://` URL) that
    /// presents a certificate signed by `ca_certificate` (base64 PEM).
    ///
    /// # Errors
    /// [`CloudError::Config`] if no client can be built from the inputs.
    pub async fn connect(
        endpoint: &str,
        ca_certificate: &str,
        token: &str,
    ) -> Result<Self, CloudError> {
        let server = if endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!("https://{endpoint}")
        };
        let kubeconfig = Kubeconfig::from_yaml(&kubeconfig_yaml(&server, ca_certificate, token))
            .map_err(|e| CloudError::Config(format!("Invalid kubeconfig: {e}")))?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| CloudError::Config(format!("Invalid kubeconfig: {e}")))?;
        let client = Client::try_from(config)?;

        debug!(server = %server, "Connected to Kubernetes API");
        Ok(Self { client })
    }

    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Server-side apply every document of `manifest`. Returns the applied
    /// objects as `kind/name`.
    ///
    /// # Errors
    /// Manifest parse errors, unknown kinds and API errors.
    pub async fn apply(&self, manifest: &Manifest) -> Result<Vec<String>, CloudError> {
        let objects = parse_manifest(manifest.yaml())?;
        info!(manifest = %manifest.name(), objects = objects.len(), "Applying manifest");

        let params = PatchParams::apply(FIELD_MANAGER).force();
        let mut applied = Vec::with_capacity(objects.len());
        for object in objects {
            let gvk = object_gvk(&object)?;
            let name = object
                .metadata
                .name
                .clone()
                .ok_or_else(|| CloudError::Manifest(format!("{} without metadata.name", gvk.kind)))?;

            let (resource, capabilities) = pinned_kind(&self.client, &gvk).await?;
            let api: Api<DynamicObject> = if matches!(capabilities.scope, Scope::Namespaced) {
                let namespace = object.metadata.namespace.as_deref().unwrap_or("default");
                Api::namespaced_with(self.client.clone(), namespace, &resource)
            } else {
                Api::all_with(self.client.clone(), &resource)
            };

            api.patch(&name, &params, &Patch::Apply(&object)).await?;
            debug!(kind = %gvk.kind, name = %name, "Applied object");
            applied.push(format!("{}/{name}", gvk.kind));
        }
        Ok(applied)
    }

    /// Rollout progress of a deployment, `None` if it does not exist.
    ///
    /// # Errors
    /// API errors other than 404.
    pub async fn deployment_progress(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DeploymentProgress>, CloudError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.as_ref().map(|deployment| {
            deployment_progress(deployment, Duration::from_secs(AVAILABILITY_GRACE_SECS))
        }))
    }

    /// Wait until the deployment is available.
    ///
    /// # Errors
    /// [`CloudError::Workload`] if the rollout stalls, [`CloudError::Timeout`]
    /// when `timeout` passes first.
    pub async fn wait_for_deployment(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), CloudError> {
        wait_until(timeout, move || async move {
            match self.deployment_progress(namespace, name).await? {
                Some(DeploymentProgress::Available) => Ok(Some(())),
                Some(DeploymentProgress::Stalled(reason)) => Err(CloudError::Workload(format!(
                    "deployment {namespace}/{name} stalled: {reason}"
                ))),
                Some(DeploymentProgress::NoAvailability) => Err(CloudError::Workload(format!(
                    "deployment {namespace}/{name} reports no Available condition"
                ))),
                Some(DeploymentProgress::Progressing) | None => Ok(None),
            }
        })
        .await?;
        info!(namespace = %namespace, name = %name, "Deployment available");
        Ok(())
    }

    /// Wait until a `LoadBalancer` service has an external IP and return it.
    ///
    /// # Errors
    /// [`CloudError::Timeout`] when `timeout` passes first.
    pub async fn wait_for_service(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<String, CloudError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        let api = &api;
        let ip = wait_until(timeout, move || async move {
            Ok::<_, CloudError>(api.get_opt(name).await?.as_ref().and_then(load_balancer_ip))
        })
        .await?;
        info!(namespace = %namespace, name = %name, ip = %ip, "Service has external IP");
        Ok(ip)
    }

    /// Wait until every scheduled pod of a daemon set is ready.
    ///
    /// # Errors
    /// [`CloudError::Timeout`] when `timeout` passes first.
    pub async fn wait_for_daemon_set(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), CloudError> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        let api = &api;
        wait_until(timeout, move || async move {
            Ok::<_, CloudError>(api
                .get_opt(name)
                .await?
                .as_ref()
                .filter(|ds| daemon_set_ready(ds))
                .map(|_| ()))
        })
        .await?;
        info!(namespace = %namespace, name = %name, "Daemon set ready");
        Ok(())
    }

    /// Submit deletion of a deployment. Returns `false` if it did not exist.
    ///
    /// # Errors
    /// API errors other than 404.
    pub async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool, CloudError> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a deployment and wait until it is gone.
    ///
    /// # Errors
    /// API errors, or [`CloudError::Timeout`] when `timeout` passes first.
    pub async fn remove_deployment(
        &self,
        namespace: &str,
        name: &str,
        timeout: Duration,
    ) -> Result<(), CloudError> {
        if !self.delete_deployment(namespace, name).await? {
            return Ok(());
        }
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let api = &api;
        wait_until(timeout, move || async move {
            Ok::<_, CloudError>(api.get_opt(name).await?.is_none().then_some(()))
        })
        .await?;
        info!(namespace = %namespace, name = %name, "Deployment removed");
        Ok(())
    }

    /// Install NVIDIA drivers on every GPU node and wait for the installer.
    ///
    /// # Errors
    /// Fetch, apply and wait errors.
    pub async fn install_gpu_drivers(
        &self,
        http: &reqwest::Client,
        timeout: Duration,
    ) -> Result<(), CloudError> {
        let manifest = crate::manifest::fetch(http, GPU_DRIVER_INSTALLER_URL).await?;
        self.apply(&manifest).await?;
        self.wait_for_daemon_set("kube-system", GPU_DRIVER_DAEMON_SET, timeout)
            .await
    }
}

/// Poll `check` every few seconds until it yields a value.
///
/// The deadline is absolute: a hung `check` is cut off at `timeout` too.
async fn wait_until<T, F, Fut>(timeout: Duration, mut check: F) -> Result<T, CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, CloudError>>,
{
    let now = Instant::now();
    let deadline = now.checked_add(timeout).unwrap_or_else(|| now + MAX_WAIT);
    loop {
        match tokio::time::timeout_at(deadline, check()).await {
            Ok(result) => {
                if let Some(value) = result? {
                    return Ok(value);
                }
            }
            Err(_) => return Err(CloudError::Timeout(timeout.as_secs())),
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(CloudError::Timeout(timeout.as_secs()));
        }
        let interval = Duration::from_secs(POLL_INTERVAL_SECS).min(deadline - now);
        tokio::time::sleep(interval).await;
    }
}

fn kubeconfig_yaml(server: &str, ca_certificate: &str, token: &str) -> String {
    format!(
        r"apiVersion: v1
kind: Config
clusters:
- name: gke
  cluster:
    server: {server}
    certificate-authority-data: {ca_certificate}
contexts:
- name: gke
  context:
    cluster: gke
    user: gke
current-context: gke
users:
- name: gke
  user:
    token: {token}
"
    )
}

/// Split a multi-document YAML manifest into objects, skipping empty documents.
///
/// # Errors
/// [`CloudError::Manifest`] for invalid YAML or documents without a kind.
pub fn parse_manifest(yaml: &str) -> Result<Vec<DynamicObject>, CloudError> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(yaml) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| CloudError::Manifest(e.to_string()))?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject =
            serde_yaml::from_value(value).map_err(|e| CloudError::Manifest(e.to_string()))?;
        object_gvk(&object)?;
        objects.push(object);
    }
    Ok(objects)
}

fn object_gvk(object: &DynamicObject) -> Result<GroupVersionKind, CloudError> {
    let types = object
        .types
        .as_ref()
        .ok_or_else(|| CloudError::Manifest("document without apiVersion/kind".to_string()))?;
    let (group, version) = types
        .api_version
        .split_once('/')
        .unwrap_or(("", types.api_version.as_str()));
    Ok(GroupVersionKind::gvk(group, version, &types.kind))
}

/// Classify a deployment from its conditions. A deployment older than `grace`
/// without an `Available` condition is reported as such.
#[must_use]
pub fn deployment_progress(deployment: &Deployment, grace: Duration) -> DeploymentProgress {
    let conditions = deployment
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_deref())
        .unwrap_or_default();

    if let Some(progressing) = conditions.iter().find(|c| c.type_ == "Progressing") {
        if progressing.status == "False" {
            let reason = progressing
                .message
                .clone()
                .or_else(|| progressing.reason.clone())
                .unwrap_or_else(|| "rollout not progressing".to_string());
            return DeploymentProgress::Stalled(reason);
        }
    }

    match conditions.iter().find(|c| c.type_ == "Available") {
        Some(available) if available.status == "True" => DeploymentProgress::Available,
        Some(_) => DeploymentProgress::Progressing,
        None => {
            let age = deployment
                .metadata
                .creation_timestamp
                .as_ref()
                .and_then(|created| (chrono::Utc::now() - created.0).to_std().ok());
            match age {
                Some(age) if age > grace => DeploymentProgress::NoAvailability,
                _ => DeploymentProgress::Progressing,
            }
        }
    }
}

/// First external IP of a load balancer service.
#[must_use]
pub fn load_balancer_ip(service: &Service) -> Option<String> {
    service
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .iter()
        .find_map(|ingress| ingress.ip.clone())
}

/// Whether every pod the daemon set wants is ready.
#[must_use]
pub fn daemon_set_ready(daemon_set: &DaemonSet) -> bool {
    daemon_set
        .status
        .as_ref()
        .is_some_and(|status| status.desired_number_scheduled == status.number_ready)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(conditions: serde_json::Value, created: &str) -> Deployment {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "triton", "creationTimestamp": created},
            "status": {"conditions": conditions}
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_manifest_skips_empty_documents() {
        let yaml = r"
apiVersion: v1
kind: Namespace
metadata:
  name: inference
---
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: triton
  namespace: inference
spec:
  replicas: 1
";
        let objects = parse_manifest(yaml).unwrap();
        assert_eq!(objects.len(), 2);

        let gvk = object_gvk(&objects[1]).unwrap();
        assert_eq!(gvk.group, "apps");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Deployment");
        assert_eq!(object_gvk(&objects[0]).unwrap().group, "");
    }

    #[test]
    fn test_parse_manifest_requires_kind() {
        let err = parse_manifest("metadata:\n  name: orphan\n").unwrap_err();
        assert!(matches!(err, CloudError::Manifest(_)));
    }

    #[test]
    fn test_deployment_progress() {
        let now = chrono::Utc::now().to_rfc3339();
        let grace = Duration::from_secs(AVAILABILITY_GRACE_SECS);

        let available = deployment(
            json!([{"type": "Available", "status": "True"}, {"type": "Progressing", "status": "True"}]),
            &now,
        );
        assert_eq!(deployment_progress(&available, grace), DeploymentProgress::Available);

        let rolling = deployment(json!([{"type": "Available", "status": "False"}]), &now);
        assert_eq!(deployment_progress(&rolling, grace), DeploymentProgress::Progressing);

        let stalled = deployment(
            json!([{"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}]),
            &now,
        );
        assert_eq!(
            deployment_progress(&stalled, grace),
            DeploymentProgress::Stalled("ProgressDeadlineExceeded".to_string())
        );

        let fresh = deployment(json!([]), &now);
        assert_eq!(deployment_progress(&fresh, grace), DeploymentProgress::Progressing);

        let old = deployment(json!([]), "2020-01-01T00:00:00Z");
        assert_eq!(deployment_progress(&old, grace), DeploymentProgress::NoAvailability);
    }

    #[test]
    fn test_load_balancer_ip() {
        let pending: Service = serde_json::from_value(json!({
            "metadata": {"name": "triton"},
            "status": {"loadBalancer": {}}
        }))
        .unwrap();
        assert_eq!(load_balancer_ip(&pending), None);

        let ready: Service = serde_json::from_value(json!({
            "metadata": {"name": "triton"},
            "status": {"loadBalancer": {"ingress": [{"ip": "35.2.3.4"}]}}
        }))
        .unwrap();
        assert_eq!(load_balancer_ip(&ready).as_deref(), Some("35.2.3.4"));
    }

    #[test]
    fn test_daemon_set_ready() {
        let ds = |desired: i32, ready: i32| -> DaemonSet {
            serde_json::from_value(json!({
                "metadata": {"name": "nvidia-driver-installer"},
                "status": {
                    "desiredNumberScheduled": desired,
                    "numberReady": ready,
                    "currentNumberScheduled": desired,
                    "numberMisscheduled": 0
                }
            }))
            .unwrap()
        };
        assert!(daemon_set_ready(&ds(2, 2)));
        assert!(!daemon_set_ready(&ds(2, 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_cuts_hung_check_at_deadline() {
        let start = Instant::now();
        let result: Result<(), CloudError> = wait_until(Duration::from_secs(20), || async {
            std::future::pending::<Result<Option<()>, CloudError>>().await
        })
        .await;

        assert!(matches!(result, Err(CloudError::Timeout(20))));
        assert_eq!(start.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_polls_until_value() {
        let polls = std::sync::atomic::AtomicU32::new(0);
        let start = Instant::now();
        let value = wait_until(Duration::from_secs(60), || {
            let n = polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { Ok::<_, CloudError>((n >= 2).then_some("10.0.0.7")) }
        })
        .await
        .unwrap();

        assert_eq!(value, "10.0.0.7");
        assert_eq!(start.elapsed(), Duration::from_secs(2 * POLL_INTERVAL_SECS));
    }

    #[test]
    fn test_kubeconfig_is_valid() {
        let yaml = kubeconfig_yaml("https://34.1.2.3", "LS0tLS1CRUdJTg==", "ya29.token");
        let kubeconfig = Kubeconfig::from_yaml(&yaml).unwrap();
        assert_eq!(kubeconfig.current_context.as_deref(), Some("gke"));
        assert_eq!(kubeconfig.clusters.len(), 1);
    }
}
