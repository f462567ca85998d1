use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of an orchestrator-side workflow object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    Cancelled,
}

impl WorkflowPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowPhase::Succeeded | WorkflowPhase::Failed | WorkflowPhase::Error | WorkflowPhase::Cancelled
        )
    }
}

/// The priority class a workflow pod is scheduled under. Drawn from the
/// fixed set the cluster's orchestrator recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriorityClassName {
    SystemCritical,
    Interactive,
    MediumPriorityBatch,
    LowPriorityBatch,
    Maintenance,
}

impl PriorityClassName {
    pub fn as_str(self) -> &'static str {
        match self {
            PriorityClassName::SystemCritical => "system-critical",
            PriorityClassName::Interactive => "interactive",
            PriorityClassName::MediumPriorityBatch => "medium-priority-batch",
            PriorityClassName::LowPriorityBatch => "low-priority-batch",
            PriorityClassName::Maintenance => "maintenance",
        }
    }
}

/// Concrete resource ask attached to a workflow spec. Deliberately a plain
/// numeric shape (not the allocator's richer type) so this crate never
/// depends on `workflow-coordinator`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
    pub gpu_count: u32,
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtlStrategy {
    pub seconds_after_success: u32,
    pub seconds_after_failure: u32,
}

impl Default for TtlStrategy {
    fn default() -> Self {
        Self {
            seconds_after_success: 3600,
            seconds_after_failure: 86_400,
        }
    }
}

/// Everything needed to create a workflow object.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub template: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub service_account_name: String,
    pub priority_class_name: Option<PriorityClassName>,
    pub resources: ResourceRequest,
    pub ttl_strategy: TtlStrategy,
    /// `{name, value}` pairs; non-string values are JSON-serialised before
    /// being handed to the orchestrator, per the external interface contract.
    pub arguments: Vec<(String, serde_json::Value)>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowObservation {
    pub phase: WorkflowPhase,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub nodes: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub user_id: Option<String>,
    pub phase: WorkflowPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricKind {
    Resource,
    Pods,
    Object,
    External,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub name: String,
    pub kind: MetricKind,
    pub current_value: Option<f64>,
    pub target_value: Option<f64>,
}

/// Aggregate node-level capacity and usage across the whole cluster, used by
/// the resource-utilisation updater (§4.5) to derive per-dimension
/// availability. Kept separate from [`AutoscalerSnapshot`] because it is read
/// from node/pod objects rather than an autoscaler.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClusterResourceSnapshot {
    pub cpu_used_millicores: u64,
    pub cpu_total_millicores: u64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub gpu_used: u64,
    pub gpu_total: u64,
}

/// A read of an autoscaler object's spec + status, shaped for the scaling
/// plane's dependency loop and scaling-event observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalerSnapshot {
    pub service: String,
    pub current_replicas: i32,
    pub desired_replicas: i32,
    pub min_replicas: i32,
    pub max_replicas: i32,
    pub current_metrics: Vec<MetricSnapshot>,
    pub target_metrics: Vec<MetricSnapshot>,
}
