//! In-memory [`OrchestratorClient`] used by the rest of the workspace's test
//! suites.

use dashmap::DashMap;

use crate::types::{
    AutoscalerSnapshot, ClusterResourceSnapshot, WorkflowObservation, WorkflowPhase, WorkflowSpec,
    WorkflowSummary,
};
use crate::{ActiveWorkflowFilter, OrchestratorClient, OrchestratorError};

struct FakeWorkflow {
    user_id: Option<String>,
    phase: WorkflowPhase,
}

#[derive(Default)]
pub struct FakeOrchestratorClient {
    workflows: DashMap<String, FakeWorkflow>,
    autoscalers: DashMap<String, AutoscalerSnapshot>,
    deployment_available: DashMap<String, i32>,
    cluster_resources: std::sync::Mutex<ClusterResourceSnapshot>,
    /// When set, the next `create_workflow` call fails with this error instead
    /// of succeeding -- used to simulate dispatch failures in queue tests.
    pub next_create_error: std::sync::Mutex<Option<String>>,
}

impl FakeOrchestratorClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_autoscaler(&self, snapshot: AutoscalerSnapshot) {
        self.autoscalers.insert(snapshot.service.clone(), snapshot);
    }

    pub fn set_deployment_available(&self, service: &str, available: i32) {
        self.deployment_available.insert(service.to_string(), available);
    }

    pub fn seed_cluster_resources(&self, snapshot: ClusterResourceSnapshot) {
        *self.cluster_resources.lock().unwrap() = snapshot;
    }

    pub fn set_phase(&self, id: &str, phase: WorkflowPhase) {
        if let Some(mut wf) = self.workflows.get_mut(id) {
            wf.phase = phase;
        }
    }

    pub fn fail_next_create(&self, message: impl Into<String>) {
        *self.next_create_error.lock().unwrap() = Some(message.into());
    }
}

#[async_trait::async_trait]
impl OrchestratorClient for FakeOrchestratorClient {
    async fn create_workflow(&self, spec: WorkflowSpec) -> Result<String, OrchestratorError> {
        if let Some(message) = self.next_create_error.lock().unwrap().take() {
            return Err(OrchestratorError::Transient(message));
        }
        let id = format!("wf-{}", uuid::Uuid::new_v4());
        let user_id = spec.labels.get("user-id").cloned();
        self.workflows.insert(
            id.clone(),
            FakeWorkflow {
                user_id,
                phase: WorkflowPhase::Running,
            },
        );
        Ok(id)
    }

    async fn get_workflow(&self, id: &str) -> Result<WorkflowObservation, OrchestratorError> {
        let wf = self
            .workflows
            .get(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        Ok(WorkflowObservation {
            phase: wf.phase,
            started_at: Some(chrono::Utc::now()),
            finished_at: None,
            nodes: serde_json::json!({}),
        })
    }

    async fn cancel_workflow(&self, id: &str) -> Result<bool, OrchestratorError> {
        let mut wf = self
            .workflows
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        if wf.phase.is_terminal() {
            return Ok(false);
        }
        wf.phase = WorkflowPhase::Cancelled;
        Ok(true)
    }

    async fn list_active_workflows(
        &self,
        filter: ActiveWorkflowFilter,
    ) -> Result<Vec<WorkflowSummary>, OrchestratorError> {
        Ok(self
            .workflows
            .iter()
            .filter(|e| !e.value().phase.is_terminal())
            .filter(|e| match &filter.user_id {
                Some(uid) => e.value().user_id.as_deref() == Some(uid.as_str()),
                None => true,
            })
            .map(|e| WorkflowSummary {
                id: e.key().clone(),
                user_id: e.value().user_id.clone(),
                phase: e.value().phase,
            })
            .collect())
    }

    async fn read_autoscaler(&self, service: &str) -> Result<AutoscalerSnapshot, OrchestratorError> {
        self.autoscalers
            .get(service)
            .map(|s| s.clone())
            .ok_or_else(|| OrchestratorError::NotFound(service.to_string()))
    }

    async fn patch_autoscaler_min(
        &self,
        service: &str,
        min_replicas: i32,
    ) -> Result<(), OrchestratorError> {
        let mut snapshot = self
            .autoscalers
            .get_mut(service)
            .ok_or_else(|| OrchestratorError::NotFound(service.to_string()))?;
        snapshot.min_replicas = min_replicas;
        if snapshot.current_replicas < min_replicas {
            snapshot.current_replicas = min_replicas;
        }
        Ok(())
    }

    async fn deployment_available_replicas(&self, service: &str) -> Result<i32, OrchestratorError> {
        Ok(self
            .deployment_available
            .get(service)
            .map(|v| *v)
            .unwrap_or(0))
    }

    async fn list_autoscaler_services(&self) -> Result<Vec<String>, OrchestratorError> {
        Ok(self.autoscalers.iter().map(|e| e.key().clone()).collect())
    }

    async fn cluster_resource_snapshot(&self) -> Result<ClusterResourceSnapshot, OrchestratorError> {
        Ok(*self.cluster_resources.lock().unwrap())
    }
}
