use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::discovery::ApiResource;
use kube::{Client, Error as KubeError};
use serde_json::json;
use tracing::{info, warn};

use crate::types::{
    AutoscalerSnapshot, ClusterResourceSnapshot, MetricKind, MetricSnapshot, WorkflowObservation,
    WorkflowPhase, WorkflowSpec, WorkflowSummary,
};
use crate::{ActiveWorkflowFilter, OrchestratorClient, OrchestratorError};

fn map_kube_err(err: KubeError) -> OrchestratorError {
    match &err {
        KubeError::Api(resp) if resp.code == 404 => OrchestratorError::NotFound(resp.message.clone()),
        KubeError::Api(resp) if resp.code >= 500 => OrchestratorError::Transient(resp.message.clone()),
        KubeError::Service(_) | KubeError::HyperError(_) => OrchestratorError::Transient(err.to_string()),
        _ => OrchestratorError::Internal(err.to_string()),
    }
}

/// Kubernetes-backed [`OrchestratorClient`].
///
/// Workflow objects are represented as a [`DynamicObject`] against a
/// configurable group/version/kind, so this crate makes no assumption about
/// which workflow engine's CRD backs `workflow_gvk` beyond the shape
/// described in the external interface contract (labels, annotations,
/// `ttlStrategy`, `podGC`, `shutdown`) -- the same shape Argo Workflows uses.
pub struct K8sOrchestratorClient {
    client: Client,
    namespace: String,
    workflow_resource: ApiResource,
    workflow_group: String,
}

impl K8sOrchestratorClient {
    pub fn new(client: Client, namespace: String, workflow_gvk: GroupVersionKind) -> Self {
        let workflow_group = workflow_gvk.group.clone();
        let workflow_resource = ApiResource::from_gvk(&workflow_gvk);
        Self {
            client,
            namespace,
            workflow_resource,
            workflow_group,
        }
    }

    fn workflows_api(&self) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &self.workflow_resource)
    }

    fn hpa_api(&self) -> Api<HorizontalPodAutoscaler> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn deployment_api(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn phase_of(obj: &DynamicObject) -> WorkflowPhase {
        let phase = obj
            .data
            .get("status")
            .and_then(|s| s.get("phase"))
            .and_then(|p| p.as_str())
            .unwrap_or("Pending");
        match phase {
            "Running" => WorkflowPhase::Running,
            "Succeeded" => WorkflowPhase::Succeeded,
            "Failed" => WorkflowPhase::Failed,
            "Error" => WorkflowPhase::Error,
            "Cancelled" | "Terminating" => WorkflowPhase::Cancelled,
            _ => WorkflowPhase::Pending,
        }
    }
}

#[async_trait::async_trait]
impl OrchestratorClient for K8sOrchestratorClient {
    async fn create_workflow(&self, spec: WorkflowSpec) -> Result<String, OrchestratorError> {
        let name = format!("wf-{}", uuid::Uuid::new_v4());

        let mut node_selector = serde_json::Map::new();
        for (k, v) in &spec.resources.node_selector {
            node_selector.insert(k.clone(), json!(v));
        }

        let arguments: Vec<serde_json::Value> = spec
            .arguments
            .iter()
            .map(|(name, value)| {
                let value_str = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                json!({ "name": name, "value": value_str })
            })
            .collect();

        let mut resources = json!({
            "requests": {
                "cpu": format!("{}m", spec.resources.cpu_millicores),
                "memory": format!("{}", spec.resources.memory_bytes),
            }
        });
        if spec.resources.gpu_count > 0 {
            resources["requests"]["nvidia.com/gpu"] = json!(spec.resources.gpu_count.to_string());
        }

        let body = json!({
            "apiVersion": format!("{}/{}", self.workflow_resource.group, self.workflow_resource.version),
            "kind": self.workflow_resource.kind,
            "metadata": {
                "name": name,
                "namespace": self.namespace,
                "labels": spec.labels,
                "annotations": spec.annotations,
            },
            "spec": {
                "templates": [{ "name": spec.template }],
                "entrypoint": spec.template,
                "serviceAccountName": spec.service_account_name,
                "nodeSelector": node_selector,
                "priorityClassName": spec.priority_class_name.map(|p| p.as_str()),
                "arguments": { "parameters": arguments },
                "podGC": { "strategy": "OnPodCompletion" },
                "ttlStrategy": {
                    "secondsAfterSuccess": spec.ttl_strategy.seconds_after_success,
                    "secondsAfterFailure": spec.ttl_strategy.seconds_after_failure,
                },
                "resources": resources,
            },
        });

        let obj: DynamicObject = serde_json::from_value(body)
            .map_err(|e| OrchestratorError::Internal(format!("build workflow object: {e}")))?;

        let created = self
            .workflows_api()
            .create(&PostParams::default(), &obj)
            .await
            .map_err(map_kube_err)?;

        let id = created
            .metadata
            .name
            .ok_or_else(|| OrchestratorError::Internal("created workflow has no name".into()))?;
        info!(workflow_id = %id, "created workflow object");
        Ok(id)
    }

    async fn get_workflow(&self, id: &str) -> Result<WorkflowObservation, OrchestratorError> {
        let obj = self.workflows_api().get(id).await.map_err(map_kube_err)?;
        let status = obj.data.get("status").cloned().unwrap_or(json!({}));
        let started_at = status
            .get("startedAt")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        let finished_at = status
            .get("finishedAt")
            .and_then(|v| v.as_str())
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));
        let nodes = status.get("nodes").cloned().unwrap_or(json!({}));

        Ok(WorkflowObservation {
            phase: Self::phase_of(&obj),
            started_at,
            finished_at,
            nodes,
        })
    }

    async fn cancel_workflow(&self, id: &str) -> Result<bool, OrchestratorError> {
        let obj = match self.workflows_api().get(id).await {
            Ok(obj) => obj,
            Err(KubeError::Api(resp)) if resp.code == 404 => {
                return Err(OrchestratorError::NotFound(id.to_string()))
            }
            Err(e) => return Err(map_kube_err(e)),
        };
        if Self::phase_of(&obj).is_terminal() {
            return Ok(false);
        }

        let completed_label = format!("workflows.{}/completed", self.workflow_group);
        let patch = json!({
            "metadata": { "labels": { completed_label: "true" } },
            "spec": { "shutdown": "Terminate" },
        });
        self.workflows_api()
            .patch(id, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_kube_err)?;
        Ok(true)
    }

    async fn list_active_workflows(
        &self,
        filter: ActiveWorkflowFilter,
    ) -> Result<Vec<WorkflowSummary>, OrchestratorError> {
        let mut lp = ListParams::default();
        if let Some(user_id) = &filter.user_id {
            lp = lp.labels(&format!("user-id={user_id}"));
        }
        let list = self.workflows_api().list(&lp).await.map_err(map_kube_err)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|obj| {
                let id = obj.metadata.name.clone()?;
                let user_id = obj
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get("user-id"))
                    .cloned();
                let phase = Self::phase_of(&obj);
                Some(WorkflowSummary { id, user_id, phase })
            })
            .filter(|w| !w.phase.is_terminal())
            .collect())
    }

    async fn read_autoscaler(&self, service: &str) -> Result<AutoscalerSnapshot, OrchestratorError> {
        let name = format!("{service}-hpa");
        let hpa = self.hpa_api().get(&name).await.map_err(map_kube_err)?;
        let spec = hpa.spec.ok_or_else(|| OrchestratorError::Internal("hpa has no spec".into()))?;
        let status = hpa
            .status
            .ok_or_else(|| OrchestratorError::Internal("hpa has no status".into()))?;

        let target_metrics = spec
            .metrics
            .unwrap_or_default()
            .iter()
            .map(metric_spec_snapshot)
            .collect();
        let current_metrics = status
            .current_metrics
            .unwrap_or_default()
            .iter()
            .map(metric_status_snapshot)
            .collect();

        Ok(AutoscalerSnapshot {
            service: service.to_string(),
            current_replicas: status.current_replicas.unwrap_or(0),
            desired_replicas: status.desired_replicas,
            min_replicas: spec.min_replicas.unwrap_or(1),
            max_replicas: spec.max_replicas,
            current_metrics,
            target_metrics,
        })
    }

    async fn patch_autoscaler_min(
        &self,
        service: &str,
        min_replicas: i32,
    ) -> Result<(), OrchestratorError> {
        let name = format!("{service}-hpa");
        let patch = json!({ "spec": { "minReplicas": min_replicas } });
        self.hpa_api()
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(map_kube_err)?;
        Ok(())
    }

    async fn deployment_available_replicas(&self, service: &str) -> Result<i32, OrchestratorError> {
        let deployment = self.deployment_api().get(service).await.map_err(map_kube_err)?;
        Ok(deployment
            .status
            .and_then(|s| s.available_replicas)
            .unwrap_or(0))
    }

    async fn list_autoscaler_services(&self) -> Result<Vec<String>, OrchestratorError> {
        let list = self
            .hpa_api()
            .list(&ListParams::default())
            .await
            .map_err(map_kube_err)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|hpa| hpa.metadata.name)
            .filter_map(|name| name.strip_suffix("-hpa").map(str::to_string))
            .collect())
    }

    /// Total capacity comes from every node's `status.allocatable`; used
    /// capacity comes from the resource requests of every non-terminal pod
    /// across the cluster. Close enough to real utilisation without needing
    /// a metrics-server dependency, and degrades gracefully when a node or
    /// pod is missing the field entirely.
    async fn cluster_resource_snapshot(&self) -> Result<ClusterResourceSnapshot, OrchestratorError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let node_list = nodes.list(&ListParams::default()).await.map_err(map_kube_err)?;

        let mut snapshot = ClusterResourceSnapshot::default();
        for node in &node_list.items {
            let Some(allocatable) = node.status.as_ref().and_then(|s| s.allocatable.as_ref()) else { continue };
            snapshot.cpu_total_millicores += quantity_millicores(allocatable.get("cpu"));
            snapshot.memory_total_bytes += quantity_bytes(allocatable.get("memory"));
            snapshot.gpu_total += quantity_count(allocatable.get("nvidia.com/gpu"));
        }

        let pods: Api<Pod> = Api::all(self.client.clone());
        let pod_list = pods.list(&ListParams::default()).await.map_err(map_kube_err)?;
        for pod in &pod_list.items {
            let running = matches!(
                pod.status.as_ref().and_then(|s| s.phase.as_deref()),
                Some("Running") | Some("Pending")
            );
            if !running {
                continue;
            }
            for container in pod.spec.iter().flat_map(|s| s.containers.iter()) {
                let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref()) else { continue };
                snapshot.cpu_used_millicores += quantity_millicores(requests.get("cpu"));
                snapshot.memory_used_bytes += quantity_bytes(requests.get("memory"));
                snapshot.gpu_used += quantity_count(requests.get("nvidia.com/gpu"));
            }
        }

        Ok(snapshot)
    }
}

/// Parse a CPU quantity (`"500m"` or `"2"`) into millicores.
fn quantity_millicores(q: Option<&Quantity>) -> u64 {
    let Some(Quantity(raw)) = q else { return 0 };
    if let Some(stripped) = raw.strip_suffix('m') {
        stripped.parse().unwrap_or(0)
    } else {
        raw.parse::<f64>().map(|cores| (cores * 1000.0) as u64).unwrap_or(0)
    }
}

/// Parse a memory quantity (`"512Mi"`, `"2Gi"`, `"1024Ki"`, or a bare byte
/// count) into bytes.
fn quantity_bytes(q: Option<&Quantity>) -> u64 {
    let Some(Quantity(raw)) = q else { return 0 };
    let units: &[(&str, u64)] = &[
        ("Ki", 1024),
        ("Mi", 1024 * 1024),
        ("Gi", 1024 * 1024 * 1024),
        ("Ti", 1024 * 1024 * 1024 * 1024),
    ];
    for (suffix, factor) in units {
        if let Some(stripped) = raw.strip_suffix(suffix) {
            return stripped.parse::<f64>().map(|n| (n * *factor as f64) as u64).unwrap_or(0);
        }
    }
    raw.parse().unwrap_or(0)
}

/// Parse a dimensionless quantity such as `nvidia.com/gpu` into a plain count.
fn quantity_count(q: Option<&Quantity>) -> u64 {
    let Some(Quantity(raw)) = q else { return 0 };
    raw.parse().unwrap_or(0)
}

fn metric_spec_snapshot(
    m: &k8s_openapi::api::autoscaling::v2::MetricSpec,
) -> MetricSnapshot {
    if let Some(r) = &m.resource {
        MetricSnapshot {
            name: r.name.clone(),
            kind: MetricKind::Resource,
            current_value: None,
            target_value: r
                .target
                .average_utilization
                .map(|v| v as f64),
        }
    } else if let Some(p) = &m.pods {
        MetricSnapshot {
            name: p.metric.name.clone(),
            kind: MetricKind::Pods,
            current_value: None,
            target_value: p.target.average_value.as_ref().and_then(|q| q.0.parse().ok()),
        }
    } else if let Some(o) = &m.object {
        MetricSnapshot {
            name: o.metric.name.clone(),
            kind: MetricKind::Object,
            current_value: None,
            target_value: o.target.value.as_ref().and_then(|q| q.0.parse().ok()),
        }
    } else if let Some(e) = &m.external {
        MetricSnapshot {
            name: e.metric.name.clone(),
            kind: MetricKind::External,
            current_value: None,
            target_value: e.target.value.as_ref().and_then(|q| q.0.parse().ok()),
        }
    } else {
        warn!("unrecognised metric spec kind");
        MetricSnapshot {
            name: "unknown".to_string(),
            kind: MetricKind::External,
            current_value: None,
            target_value: None,
        }
    }
}

fn metric_status_snapshot(
    m: &k8s_openapi::api::autoscaling::v2::MetricStatus,
) -> MetricSnapshot {
    if let Some(r) = &m.resource {
        MetricSnapshot {
            name: r.name.clone(),
            kind: MetricKind::Resource,
            current_value: r.current.average_utilization.map(|v| v as f64),
            target_value: None,
        }
    } else if let Some(p) = &m.pods {
        MetricSnapshot {
            name: p.metric.name.clone(),
            kind: MetricKind::Pods,
            current_value: p.current.average_value.as_ref().and_then(|q| q.0.parse().ok()),
            target_value: None,
        }
    } else if let Some(o) = &m.object {
        MetricSnapshot {
            name: o.metric.name.clone(),
            kind: MetricKind::Object,
            current_value: o.current.value.as_ref().and_then(|q| q.0.parse().ok()),
            target_value: None,
        }
    } else if let Some(e) = &m.external {
        MetricSnapshot {
            name: e.metric.name.clone(),
            kind: MetricKind::External,
            current_value: e.current.value.as_ref().and_then(|q| q.0.parse().ok()),
            target_value: None,
        }
    } else {
        MetricSnapshot {
            name: "unknown".to_string(),
            kind: MetricKind::External,
            current_value: None,
            target_value: None,
        }
    }
}
