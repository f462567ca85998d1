//! Builds the orchestrator-facing workflow spec for a task: labels,
//! annotations, node selectors, priority class, TTL strategy, and resource
//! requests, derived from the task and the resource allocation already
//! computed for it.

use std::collections::BTreeMap;

use orchestrator::types::{PriorityClassName, ResourceRequest, TtlStrategy, WorkflowSpec};

use crate::types::{Priority, QualityTier, ResourceAllocation, SubscriptionTier, Task};

fn priority_class_name(priority: Priority) -> PriorityClassName {
    match priority {
        Priority::High => PriorityClassName::SystemCritical,
        Priority::Medium => PriorityClassName::Interactive,
        Priority::Low => PriorityClassName::MediumPriorityBatch,
        Priority::Batch => PriorityClassName::LowPriorityBatch,
    }
}

/// Template name used by the orchestrator's workflow definitions for a given
/// task type. Unrecognised types fall back to a generic template so that
/// new task types don't need a coordinator release to become dispatchable.
fn template_for(task_type: &str) -> String {
    format!("{task_type}-template")
}

pub fn build_workflow_spec(
    task: &Task,
    quality: QualityTier,
    subscription: SubscriptionTier,
    allocation: &ResourceAllocation,
) -> WorkflowSpec {
    let mut labels = BTreeMap::new();
    labels.insert("task-id".to_string(), task.id.clone());
    if let Some(user_id) = &task.user_id {
        labels.insert("user".to_string(), user_id.clone());
    }
    labels.insert("priority".to_string(), task.priority.as_str().to_string());

    let mut annotations = BTreeMap::new();
    annotations.insert("task-type".to_string(), task.task_type.clone());
    annotations.insert("quality".to_string(), quality.as_str().to_string());
    annotations.insert("subscription-tier".to_string(), format!("{subscription:?}").to_lowercase());

    let mut resources = ResourceRequest {
        cpu_millicores: allocation.cpu_millicores,
        memory_bytes: allocation.memory_bytes,
        gpu_count: allocation.gpu_count,
        node_selector: allocation.node_selector.clone(),
    };
    if resources.gpu_count > 0 {
        resources
            .node_selector
            .entry("nvidia.com/gpu".to_string())
            .or_insert_with(|| resources.gpu_count.to_string());
    }

    let arguments = task
        .parameters
        .iter()
        .map(|(key, value)| (key.clone(), value.to_json()))
        .collect();

    WorkflowSpec {
        template: template_for(&task.task_type),
        labels,
        annotations,
        service_account_name: String::new(),
        priority_class_name: Some(priority_class_name(task.priority)),
        resources,
        ttl_strategy: TtlStrategy::default(),
        arguments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ParamValue, Parameters};
    use std::collections::BTreeMap as Map;

    #[test]
    fn gpu_allocation_adds_nvidia_node_selector() {
        let mut parameters: Parameters = Map::new();
        parameters.insert("model".to_string(), ParamValue::String("resnet".into()));
        let task = Task::new("inference".into(), parameters, Priority::High, None, None, 3, None, None);
        let allocation = ResourceAllocation {
            cpu_millicores: 2000,
            memory_bytes: 8 * 1024 * 1024 * 1024,
            gpu_count: 1,
            node_selector: BTreeMap::new(),
        };
        let spec = build_workflow_spec(&task, QualityTier::Medium, SubscriptionTier::Premium, &allocation);
        assert_eq!(spec.resources.node_selector.get("nvidia.com/gpu"), Some(&"1".to_string()));
        assert!(spec.priority_class_name.is_some());
    }

    #[test]
    fn priority_class_follows_task_priority() {
        let parameters: Parameters = Map::new();
        let task = Task::new("inference".into(), parameters, Priority::Batch, None, None, 1, None, None);
        let allocation = ResourceAllocation {
            cpu_millicores: 500,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            gpu_count: 0,
            node_selector: BTreeMap::new(),
        };
        let spec = build_workflow_spec(&task, QualityTier::Low, SubscriptionTier::Free, &allocation);
        assert_eq!(spec.priority_class_name, Some(PriorityClassName::LowPriorityBatch));
    }
}
