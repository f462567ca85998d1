//! Task queue manager: the hard core (§4.6). Ingests submissions, runs the
//! per-priority scheduling loops, consults the quality assessor and resource
//! allocator before every dispatch, and applies workflow lifecycle events
//! coming back from the orchestrator.

pub mod circuit_breaker;
pub mod dispatch;
pub mod fingerprint;
pub mod message_bus;
pub mod quality_assessor;
pub mod queue;
pub mod resource_allocator;
pub mod result_cache;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use config_manager::CoordinatorConfig;
use coordinator_metrics::CoordinatorMetrics;
use orchestrator::{OrchestratorClient, OrchestratorError};
use store::json_ext::KvStoreJsonExt;
use store::KvStore;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{error, info, warn};

use circuit_breaker::CircuitBreakerRegistry;
use message_bus::{
    BusMessage, MessageBus, TaskCancellationEvent, TaskSubmissionEvent, WorkflowEvent,
    WorkflowEventStatus, TOPIC_TASK_CANCELLATIONS, TOPIC_TASK_SUBMISSIONS, TOPIC_WORKFLOW_EVENTS,
};
use quality_assessor::QualityAssessor;
use queue::{ConcurrencyGuard, RateLimiter, SchedulingContext, StepOutcome};
use resource_allocator::ResourceAllocator;
use result_cache::{Lookup, ResultCache};
use types::{Parameters, Priority, QualityPreference, QualityRequest, QualityTier, SubscriptionTier, Task, TaskStatus};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("task not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] store::StoreError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The JSON-shaped value stored at `cache:workflow:<fingerprint>`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CachedResult {
    pub workflow_id: String,
    pub result: serde_json::Value,
    pub task_type: String,
    pub created_at: chrono::DateTime<Utc>,
    pub expires_at: chrono::DateTime<Utc>,
}

impl result_cache::CacheEntry for CachedResult {
    fn expires_at(&self) -> chrono::DateTime<Utc> {
        self.expires_at
    }
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Completed => "completed",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

/// Move one unit of the `active_workflows{task_type,status}` gauge from
/// `from` to `to`. `from` is `None` for a task's first transition (creation),
/// which only increments the destination cell.
fn update_active_gauge(metrics: &CoordinatorMetrics, task_type: &str, from: Option<TaskStatus>, to: TaskStatus) {
    if let Some(from) = from {
        metrics.active_workflows.with_label_values(&[task_type, status_label(from)]).dec();
    }
    metrics.active_workflows.with_label_values(&[task_type, status_label(to)]).inc();
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Short-circuited: an existing workflow already satisfies this request.
    CacheHit { workflow_id: String },
    /// Persisted and enqueued for dispatch.
    Enqueued { task_id: String },
}

pub struct TaskSubmission {
    pub task_type: String,
    pub parameters: Parameters,
    pub priority: Priority,
    pub user_id: Option<String>,
    pub subscription_tier: Option<SubscriptionTier>,
    pub quality_preference: Option<QualityPreference>,
    pub quality_target: Option<QualityTier>,
}

/// Fields stripped from parameters before fingerprinting (§4.3): user-
/// specific or volatile values that don't change what the computation
/// produces, plus the quality-preference fields that steer the assessor but
/// not the underlying result.
const VOLATILE_PARAM_KEYS: &[&str] = &["userId", "timestamp", "requestId", "qualityPreference", "qualityTarget"];

fn fingerprint_parameters(parameters: &Parameters) -> Parameters {
    parameters
        .iter()
        .filter(|(k, _)| !VOLATILE_PARAM_KEYS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub struct TaskQueueManager {
    store: Arc<dyn KvStore>,
    orchestrator: Arc<dyn OrchestratorClient>,
    metrics: Arc<CoordinatorMetrics>,
    bus: Arc<dyn MessageBus>,
    breakers: CircuitBreakerRegistry,
    cache: ResultCache,
    quality: QualityAssessor,
    allocator: ResourceAllocator,
    config: CoordinatorConfig,
    concurrency: HashMap<Priority, ConcurrencyGuard>,
    rate_limiters: HashMap<Priority, RateLimiter>,
}

impl TaskQueueManager {
    pub fn new(
        store: Arc<dyn KvStore>,
        orchestrator: Arc<dyn OrchestratorClient>,
        metrics: Arc<CoordinatorMetrics>,
        bus: Arc<dyn MessageBus>,
        config: CoordinatorConfig,
    ) -> Self {
        let concurrency = Priority::ALL.into_iter().map(|p| (p, ConcurrencyGuard::default())).collect();
        let rate_limiters = Priority::ALL
            .into_iter()
            .map(|p| {
                let rps = config.queues.for_priority(p.into()).rate_limit_per_second;
                (p, RateLimiter::new(rps))
            })
            .collect();
        Self {
            cache: ResultCache::new(store.clone(), config.cache.clone()),
            quality: QualityAssessor::new(store.clone()),
            allocator: ResourceAllocator::new(store.clone()),
            breakers: CircuitBreakerRegistry::new(config.circuit_breaker.clone()),
            store,
            orchestrator,
            metrics,
            bus,
            config,
            concurrency,
            rate_limiters,
        }
    }

    pub fn metrics(&self) -> &CoordinatorMetrics {
        &self.metrics
    }

    /// §4.6 Submission. A fingerprint hit returns the existing workflow id
    /// without enqueueing a second build; otherwise the task is persisted and
    /// pushed onto its priority queue scored by `now`.
    pub async fn submit_task(&self, submission: TaskSubmission) -> Result<SubmitOutcome, TaskError> {
        if submission.task_type.trim().is_empty() {
            return Err(TaskError::Validation("task_type must not be empty".into()));
        }

        if submission.task_type != "workflow" {
            let fp_params = fingerprint_parameters(&submission.parameters);
            let (lookup, cached) = self
                .cache
                .lookup_or_reserve::<CachedResult>(&submission.task_type, &fp_params)
                .await?;
            if lookup == Lookup::Hit {
                let cached = cached.expect("Lookup::Hit always carries a value");
                self.metrics.workflow_cache_hit_total.with_label_values(&[&submission.task_type]).inc();
                return Ok(SubmitOutcome::CacheHit { workflow_id: cached.workflow_id });
            }
            if lookup == Lookup::InFlight {
                // Another submission already holds the reservation for this
                // fingerprint. Per the "submissions never block" backpressure
                // policy (§5) this submission still gets its own task and its
                // own queue slot rather than waiting; `dispatch` rechecks the
                // cache at its own dispatch turn, so in the common case the
                // in-flight build finishes first and this task is satisfied
                // from the cache instead of starting a second workflow.
                info!(task_type = %submission.task_type, "fingerprint already has a build in flight");
            }
        }

        let queue_config = self.config.queues.for_priority(submission.priority.into());
        let max_attempts = queue_config.max_retries + 1;
        let task = Task::new(
            submission.task_type.clone(),
            submission.parameters,
            submission.priority,
            submission.user_id,
            submission.subscription_tier,
            max_attempts,
            submission.quality_preference,
            submission.quality_target,
        );

        self.store.set_json(&Task::key(&task.id), &task, None).await?;
        self.store
            .zadd(&submission.priority.queue_key(), &task.id, Utc::now().timestamp_millis() as f64)
            .await?;

        self.bus
            .publish(
                TOPIC_TASK_SUBMISSIONS,
                BusMessage::TaskSubmitted(TaskSubmissionEvent {
                    task_id: task.id.clone(),
                    task_type: task.task_type.clone(),
                    priority: task.priority,
                }),
            )
            .await;

        update_active_gauge(&self.metrics, &task.task_type, None, TaskStatus::Pending);

        Ok(SubmitOutcome::Enqueued { task_id: task.id })
    }

    pub async fn get_task(&self, id: &str) -> Result<Option<Task>, TaskError> {
        Ok(self.store.get_json::<Task>(&Task::key(id)).await?)
    }

    /// §4.6 Cancellation. Idempotent: cancelling an already-terminal task
    /// returns `Ok(false)` instead of erroring.
    pub async fn cancel_task(&self, id: &str) -> Result<bool, TaskError> {
        let Some(mut task) = self.get_task(id).await? else {
            return Err(TaskError::NotFound(id.to_string()));
        };
        if task.is_terminal() {
            return Ok(false);
        }

        let bound_workflow = task.workflow_id.clone();
        let old_status = task.status;
        task.status = TaskStatus::Cancelled;
        task.completed_at = Some(Utc::now());
        self.store.set_json(&Task::key(&task.id), &task, None).await?;
        self.store.zrem(&task.priority.queue_key(), &task.id).await?;
        update_active_gauge(&self.metrics, &task.task_type, Some(old_status), TaskStatus::Cancelled);

        if let Some(workflow_id) = bound_workflow {
            match self.orchestrator.cancel_workflow(&workflow_id).await {
                Ok(_) => {}
                Err(OrchestratorError::NotFound(_)) => {}
                Err(err) => warn!(task_id = %task.id, %err, "failed to cancel bound workflow"),
            }
        }

        self.metrics.workflow_cancelled_total.with_label_values(&[&task.task_type]).inc();
        self.bus
            .publish(
                TOPIC_TASK_CANCELLATIONS,
                BusMessage::TaskCancelled(TaskCancellationEvent { task_id: task.id.clone() }),
            )
            .await;

        Ok(true)
    }

    /// §4.6 Workflow event ingestion. A cancelled task is never promoted back
    /// to COMPLETED even if its workflow later succeeds (§5 Cancellation).
    pub async fn apply_workflow_event(&self, event: WorkflowEvent) -> Result<(), TaskError> {
        let Some(mut task) = self.get_task(&event.task_id).await? else {
            warn!(task_id = %event.task_id, "workflow event for unknown task");
            return Ok(());
        };
        if task.is_terminal() {
            return Ok(());
        }

        let old_status = task.status;
        task.status = match event.status {
            WorkflowEventStatus::Succeeded => TaskStatus::Completed,
            WorkflowEventStatus::Failed | WorkflowEventStatus::Error => TaskStatus::Failed,
            WorkflowEventStatus::Cancelled => TaskStatus::Cancelled,
        };
        task.completed_at = Some(Utc::now());
        self.store.set_json(&Task::key(&task.id), &task, None).await?;
        update_active_gauge(&self.metrics, &task.task_type, Some(old_status), task.status);

        if let (Some(started_at), Some(completed_at)) = (task.started_at, task.completed_at) {
            let duration = (completed_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
            self.metrics.workflow_duration_seconds.with_label_values(&[&task.task_type]).observe(duration);
        }

        match task.status {
            TaskStatus::Completed => self.metrics.workflow_completed_total.with_label_values(&[&task.task_type]).inc(),
            TaskStatus::Failed => self.metrics.workflow_error_total.with_label_values(&[&task.task_type]).inc(),
            _ => {}
        }
        Ok(())
    }

    /// One tick of `priority`'s scheduling loop: refresh the queue-depth
    /// gauge, wait for the rate-limit slot, then attempt a single dispatch.
    pub async fn run_priority_tick(&self, priority: Priority) -> Result<(), TaskError> {
        if let Ok(depth) = self.store.zcount(&priority.queue_key(), f64::MIN, f64::MAX).await {
            self.metrics.queue_depth.with_label_values(&[priority.as_str()]).set(depth as i64);
        }

        self.rate_limiters[&priority].wait_for_slot().await;

        let queue_config = self.config.queues.for_priority(priority.into()).clone();
        let ctx = SchedulingContext {
            store: self.store.as_ref(),
            breakers: &self.breakers,
            concurrency: &self.concurrency[&priority],
            config: &queue_config,
            metrics: self.metrics.as_ref(),
        };

        let task = match queue::step(&ctx, priority).await? {
            StepOutcome::Dispatched { task } => task,
            StepOutcome::Idle | StepOutcome::Requeued => return Ok(()),
        };

        let dispatch_result = self.dispatch(&task).await.map_err(|e| e.to_string());
        let task = queue::record_outcome(&ctx, task, priority, dispatch_result).await?;

        if task.status == TaskStatus::Failed {
            self.metrics.workflow_error_total.with_label_values(&[&task.task_type]).inc();
            if task.task_type != "workflow" {
                let fp_params = fingerprint_parameters(&task.parameters);
                self.cache.release_reservation(&task.task_type, &fp_params).await.ok();
            }
        }
        Ok(())
    }

    /// Quality assessment, resource allocation, workflow spec construction,
    /// and submission to the orchestrator. Rechecks the result cache first:
    /// if another dispatch for the same fingerprint finished while this task
    /// was queued, its workflow is reused instead of building a second one
    /// (the InFlight reservation's actual stampede guard, applied at dispatch
    /// time rather than at submission time so submissions never block). On a
    /// fresh build, also seeds the result cache so the next identical request
    /// short-circuits to this workflow.
    async fn dispatch(&self, task: &Task) -> Result<String, TaskError> {
        if task.task_type != "workflow" {
            let fp_params = fingerprint_parameters(&task.parameters);
            if let Some(cached) = self.cache.peek::<CachedResult>(&task.task_type, &fp_params).await? {
                self.metrics.workflow_cache_hit_total.with_label_values(&[&task.task_type]).inc();
                return Ok(cached.workflow_id);
            }
        }

        let subscription = task.subscription_tier.unwrap_or(SubscriptionTier::Free);
        let assessment = self
            .quality
            .assess(QualityRequest {
                task_type: &task.task_type,
                parameters: &task.parameters,
                subscription_tier: subscription,
                quality_preference: task.quality_preference,
                quality_target: task.quality_target,
            })
            .await;
        self.quality.record_selection(&task.task_type, assessment.tier).await?;

        let allocation = self.allocator.allocate(assessment.tier, task.priority, subscription).await;
        let spec = dispatch::build_workflow_spec(task, assessment.tier, subscription, &allocation);

        let workflow_id = self.orchestrator.create_workflow(spec).await?;

        if task.task_type != "workflow" {
            let fp_params = fingerprint_parameters(&task.parameters);
            let cached = CachedResult {
                workflow_id: workflow_id.clone(),
                result: serde_json::Value::Null,
                task_type: task.task_type.clone(),
                created_at: Utc::now(),
                expires_at: Utc::now() + chrono::Duration::seconds(self.config.cache.default_ttl_seconds as i64),
            };
            self.cache.store_result(&task.task_type, &fp_params, &cached).await?;
        }

        Ok(workflow_id)
    }

    /// Hourly cleanup (§3 Lifecycle): remove terminal tasks older than seven
    /// days and prune their entry from `failed-tasks`.
    pub async fn cleanup_terminal_tasks(&self) -> Result<usize, TaskError> {
        let cutoff = Utc::now() - chrono::Duration::days(self.config.cleanup.terminal_task_retention_days);
        let keys = self.store.scan_prefix("task:").await?;
        let mut removed = 0;
        for key in keys {
            let Some(task) = self.store.get_json::<Task>(&key).await? else { continue };
            if task.is_terminal() && task.completed_at.map(|t| t < cutoff).unwrap_or(false) {
                self.store.delete(&key).await?;
                self.store.zrem("failed-tasks", &task.id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Long-lived scheduling loop for one priority. Exits within one tick of
    /// `shutdown` being set, per the cooperative-cancellation contract (§9).
    pub async fn run_priority_loop(self: Arc<Self>, priority: Priority, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                result = self.run_priority_tick(priority) => {
                    if let Err(err) = result {
                        error!(priority = priority.as_str(), %err, "scheduling tick failed");
                    }
                }
            }
        }
    }

    /// Hourly cleanup loop.
    pub async fn run_cleanup_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                _ = ticker.tick() => {
                    match self.cleanup_terminal_tasks().await {
                        Ok(removed) => info!(removed, "cleanup pass complete"),
                        Err(err) => error!(%err, "cleanup pass failed"),
                    }
                }
            }
        }
    }

    /// Consumes `workflow-events` off the bus and applies them to bound tasks.
    pub async fn run_workflow_event_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut receiver = self.bus.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                _ = shutdown.changed() => continue,
                message = receiver.recv() => {
                    match message {
                        Ok((topic, BusMessage::WorkflowEvent(event))) if topic == TOPIC_WORKFLOW_EVENTS => {
                            if let Err(err) = self.apply_workflow_event(event).await {
                                error!(%err, "failed to apply workflow event");
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "workflow event subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::fake::FakeOrchestratorClient;
    use std::collections::BTreeMap as Map;
    use store::fake::InMemoryStore;
    use types::ParamValue;

    fn manager() -> Arc<TaskQueueManager> {
        Arc::new(TaskQueueManager::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(FakeOrchestratorClient::new()),
            Arc::new(CoordinatorMetrics::new().unwrap()),
            Arc::new(message_bus::InProcessMessageBus::default()),
            CoordinatorConfig::default(),
        ))
    }

    fn submission(task_type: &str, params: Parameters) -> TaskSubmission {
        TaskSubmission {
            task_type: task_type.to_string(),
            parameters: params,
            priority: Priority::High,
            user_id: Some("user-1".into()),
            subscription_tier: Some(SubscriptionTier::Premium),
            quality_preference: None,
            quality_target: None,
        }
    }

    #[tokio::test]
    async fn submit_then_get_returns_pending() {
        let manager = manager();
        let outcome = manager.submit_task(submission("inference", Map::new())).await.unwrap();
        let SubmitOutcome::Enqueued { task_id } = outcome else { panic!("expected enqueue") };
        let task = manager.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn cache_hit_path_short_circuits_second_submission() {
        let manager = manager();
        let mut params: Parameters = Map::new();
        params.insert("image-resolution".to_string(), ParamValue::String("low".into()));

        let first = manager.submit_task(submission("material-recognition", params.clone())).await.unwrap();
        let SubmitOutcome::Enqueued { task_id } = first else { panic!("expected first submission to enqueue") };

        // Drive one dispatch tick to completion.
        manager.run_priority_tick(Priority::High).await.unwrap();
        let task = manager.get_task(&task_id).await.unwrap().unwrap();
        assert!(task.workflow_id.is_some());

        let second = manager.submit_task(submission("material-recognition", params)).await.unwrap();
        match second {
            SubmitOutcome::CacheHit { workflow_id } => assert_eq!(Some(workflow_id), task.workflow_id),
            SubmitOutcome::Enqueued { .. } => panic!("expected a cache hit on the second submission"),
        }
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let manager = manager();
        let outcome = manager.submit_task(submission("inference", Map::new())).await.unwrap();
        let SubmitOutcome::Enqueued { task_id } = outcome else { panic!("expected enqueue") };

        assert!(manager.cancel_task(&task_id).await.unwrap());
        assert!(!manager.cancel_task(&task_id).await.unwrap());
        let task = manager.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn retry_keeps_task_pending_within_retry_budget() {
        let store = Arc::new(InMemoryStore::new());
        let orchestrator = Arc::new(FakeOrchestratorClient::new());
        let manager = Arc::new(TaskQueueManager::new(
            store,
            orchestrator.clone(),
            Arc::new(CoordinatorMetrics::new().unwrap()),
            Arc::new(message_bus::InProcessMessageBus::default()),
            CoordinatorConfig::default(),
        ));

        orchestrator.fail_next_create("transient");
        let outcome = manager.submit_task(submission("inference", Map::new())).await.unwrap();
        let SubmitOutcome::Enqueued { task_id } = outcome else { panic!("expected enqueue") };

        manager.run_priority_tick(Priority::High).await.unwrap();
        let task = manager.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
    }

    #[tokio::test]
    async fn workflow_event_does_not_resurrect_a_cancelled_task() {
        let manager = manager();
        let outcome = manager.submit_task(submission("inference", Map::new())).await.unwrap();
        let SubmitOutcome::Enqueued { task_id } = outcome else { panic!("expected enqueue") };
        manager.cancel_task(&task_id).await.unwrap();

        manager
            .apply_workflow_event(WorkflowEvent {
                workflow_id: "wf-x".into(),
                task_id: task_id.clone(),
                status: WorkflowEventStatus::Succeeded,
            })
            .await
            .unwrap();

        let task = manager.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
    }
}
