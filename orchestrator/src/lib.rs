//! Orchestrator adapter.
//!
//! The only component that speaks to the cluster orchestrator: creates,
//! reads, patches and deletes workflow objects, and reads/patches horizontal
//! autoscaler objects. Every other crate depends on the [`OrchestratorClient`]
//! trait, never on `kube` directly.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod k8s;
pub mod types;

#[cfg(feature = "test-util")]
pub mod fake;

pub use k8s::K8sOrchestratorClient;
pub use types::*;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient orchestrator error: {0}")]
    Transient(String),
    #[error("orchestrator error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveWorkflowFilter {
    pub user_id: Option<String>,
}

#[async_trait]
pub trait OrchestratorClient: Send + Sync {
    /// Create a workflow object from `spec`. Fails with [`OrchestratorError::Internal`]
    /// on a non-2xx response from the orchestrator.
    async fn create_workflow(&self, spec: WorkflowSpec) -> Result<String, OrchestratorError>;

    async fn get_workflow(&self, id: &str) -> Result<WorkflowObservation, OrchestratorError>;

    /// Idempotent cancellation. Returns `false` if the workflow was already
    /// terminal (the adapter tolerates already-cancelled state).
    async fn cancel_workflow(&self, id: &str) -> Result<bool, OrchestratorError>;

    async fn list_active_workflows(
        &self,
        filter: ActiveWorkflowFilter,
    ) -> Result<Vec<WorkflowSummary>, OrchestratorError>;

    async fn read_autoscaler(&self, service: &str) -> Result<AutoscalerSnapshot, OrchestratorError>;

    async fn patch_autoscaler_min(
        &self,
        service: &str,
        min_replicas: i32,
    ) -> Result<(), OrchestratorError>;

    /// `availableReplicas` of the deployment an autoscaler targets, used by
    /// the scaling-event observer to classify limited-scale events.
    async fn deployment_available_replicas(&self, service: &str) -> Result<i32, OrchestratorError>;

    /// All services that currently have an autoscaler object, for the
    /// scaling-event observer's periodic sweep.
    async fn list_autoscaler_services(&self) -> Result<Vec<String>, OrchestratorError>;

    /// Node-level capacity and usage aggregated across the whole cluster, for
    /// the resource allocator's periodic availability updater.
    async fn cluster_resource_snapshot(&self) -> Result<ClusterResourceSnapshot, OrchestratorError>;
}
