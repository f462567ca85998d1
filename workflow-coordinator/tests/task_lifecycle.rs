//! Black-box coverage of submission through dispatch, driven entirely
//! through `TaskQueueManager`'s public API against the in-memory fakes, the
//! same way the rest of the workspace exercises the manager without a live
//! Redis/Kubernetes cluster.

use std::collections::BTreeMap;
use std::sync::Arc;

use config_manager::CoordinatorConfig;
use coordinator_metrics::CoordinatorMetrics;
use orchestrator::fake::FakeOrchestratorClient;
use store::fake::InMemoryStore;
use workflow_coordinator::message_bus::InProcessMessageBus;
use workflow_coordinator::types::{Priority, TaskStatus};
use workflow_coordinator::{SubmitOutcome, TaskQueueManager, TaskSubmission};

fn new_manager() -> Arc<TaskQueueManager> {
    Arc::new(TaskQueueManager::new(
        Arc::new(InMemoryStore::new()),
        Arc::new(FakeOrchestratorClient::new()),
        Arc::new(CoordinatorMetrics::new().unwrap()),
        Arc::new(InProcessMessageBus::default()),
        CoordinatorConfig::default(),
    ))
}

fn submission(task_type: &str) -> TaskSubmission {
    TaskSubmission {
        task_type: task_type.to_string(),
        parameters: BTreeMap::new(),
        priority: Priority::High,
        user_id: Some("user-1".to_string()),
        subscription_tier: None,
        quality_preference: None,
        quality_target: None,
    }
}

#[tokio::test]
async fn submitted_task_runs_to_completion_through_a_priority_tick() {
    let manager = new_manager();

    let outcome = manager.submit_task(submission("3d-reconstruction")).await.unwrap();
    let task_id = match outcome {
        SubmitOutcome::Enqueued { task_id } => task_id,
        SubmitOutcome::CacheHit { .. } => panic!("expected a fresh enqueue"),
    };

    manager.run_priority_tick(Priority::High).await.unwrap();

    let task = manager.get_task(&task_id).await.unwrap().expect("task persisted");
    assert_eq!(task.status, TaskStatus::Running);
    assert!(task.workflow_id.is_some());
}

#[tokio::test]
async fn second_identical_submission_is_a_cache_hit_after_dispatch() {
    let manager = new_manager();

    let first = manager.submit_task(submission("material-recognition")).await.unwrap();
    let task_id = match first {
        SubmitOutcome::Enqueued { task_id } => task_id,
        SubmitOutcome::CacheHit { .. } => panic!("expected a fresh enqueue"),
    };
    manager.run_priority_tick(Priority::High).await.unwrap();
    let dispatched = manager.get_task(&task_id).await.unwrap().unwrap();
    let workflow_id = dispatched.workflow_id.expect("dispatched task has a workflow id");

    let second = manager.submit_task(submission("material-recognition")).await.unwrap();
    match second {
        SubmitOutcome::CacheHit { workflow_id: hit } => assert_eq!(hit, workflow_id),
        SubmitOutcome::Enqueued { .. } => panic!("expected the cached result to short-circuit"),
    }
}

#[tokio::test]
async fn cancelling_a_pending_task_removes_it_from_the_queue() {
    let manager = new_manager();

    let outcome = manager.submit_task(submission("scene-graph")).await.unwrap();
    let task_id = match outcome {
        SubmitOutcome::Enqueued { task_id } => task_id,
        SubmitOutcome::CacheHit { .. } => panic!("expected a fresh enqueue"),
    };

    let cancelled = manager.cancel_task(&task_id).await.unwrap();
    assert!(cancelled);

    // A tick must not resurrect the cancelled task by dispatching it.
    manager.run_priority_tick(Priority::High).await.unwrap();
    let task = manager.get_task(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.workflow_id.is_none());

    // Idempotent: cancelling again reports no-op rather than erroring.
    assert!(!manager.cancel_task(&task_id).await.unwrap());
}

#[tokio::test]
async fn unknown_task_type_falls_through_to_enqueue_without_caching() {
    let manager = new_manager();
    // "workflow" is excluded from fingerprinting per submit_task's own rule.
    let first = manager.submit_task(submission("workflow")).await.unwrap();
    assert!(matches!(first, SubmitOutcome::Enqueued { .. }));
    let second = manager.submit_task(submission("workflow")).await.unwrap();
    assert!(matches!(second, SubmitOutcome::Enqueued { .. }));
}
