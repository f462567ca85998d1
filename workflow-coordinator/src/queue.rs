//! Per-priority scheduling loop: pop the earliest-eligible task, gate it
//! through the circuit breaker, dispatch it, and re-queue on retryable
//! failure with exponential backoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use config_manager::QueueConfig;
use coordinator_metrics::CoordinatorMetrics;
use store::json_ext::KvStoreJsonExt;
use store::KvStore;
use tracing::{info, warn};

use crate::circuit_breaker::{CircuitBreakerRegistry, Gate};
use crate::types::{Priority, Task, TaskStatus};
use crate::update_active_gauge;

/// Running-count guard for one priority's concurrency cap. Counted
/// independently per priority so a busy HIGH queue never starves LOW.
#[derive(Default)]
pub struct ConcurrencyGuard {
    running: AtomicU32,
}

impl ConcurrencyGuard {
    pub fn running(&self) -> u32 {
        self.running.load(Ordering::Acquire)
    }

    fn enter(&self) {
        self.running.fetch_add(1, Ordering::AcqRel);
    }

    fn leave(&self) {
        self.running.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct RateLimiter {
    interval: Duration,
    next_slot: parking_lot::Mutex<tokio::time::Instant>,
}

impl RateLimiter {
    pub fn new(rate_per_second: u32) -> Self {
        let rate = rate_per_second.max(1);
        Self {
            interval: Duration::from_secs_f64(1.0 / rate as f64),
            next_slot: parking_lot::Mutex::new(tokio::time::Instant::now()),
        }
    }

    /// Sleep until this caller's slot, then reserve the next one.
    pub async fn wait_for_slot(&self) {
        let target = {
            let mut slot = self.next_slot.lock();
            let now = tokio::time::Instant::now();
            let target = (*slot).max(now);
            *slot = target + self.interval;
            target
        };
        tokio::time::sleep_until(target).await;
    }
}

pub fn retry_backoff(base_ms: u64, attempts: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempts.saturating_sub(1));
    Duration::from_millis(base_ms.saturating_mul(factor))
}

/// One iteration of a priority's scheduling loop. Returns whether a task was
/// popped at all (used by tests and by the caller to decide how long to
/// idle before the next iteration).
pub struct SchedulingContext<'a> {
    pub store: &'a dyn KvStore,
    pub breakers: &'a CircuitBreakerRegistry,
    pub concurrency: &'a ConcurrencyGuard,
    pub config: &'a QueueConfig,
    pub metrics: &'a CoordinatorMetrics,
}

pub enum StepOutcome {
    Idle,
    Requeued,
    Dispatched { task: Task },
}

/// Pop at most one eligible task from `priority`'s queue and apply the
/// pre-dispatch bookkeeping (cancellation check, circuit breaker gate,
/// RUNNING transition). The caller is responsible for actually invoking the
/// orchestrator adapter and calling [`record_success`]/[`record_failure`]
/// afterwards; this keeps this module free of the orchestrator dependency.
pub async fn step(ctx: &SchedulingContext<'_>, priority: Priority) -> anyhow::Result<StepOutcome> {
    if ctx.concurrency.running() >= ctx.config.concurrency {
        return Ok(StepOutcome::Idle);
    }

    let queue_key = priority.queue_key();
    let now = Utc::now().timestamp_millis() as f64;
    let Some(popped) = ctx.store.zpop_min(&queue_key).await? else {
        return Ok(StepOutcome::Idle);
    };

    if popped.score > now {
        // Not yet eligible: put it back and idle this tick.
        ctx.store.zadd(&queue_key, &popped.member, popped.score).await?;
        return Ok(StepOutcome::Idle);
    }

    let task_key = Task::key(&popped.member);
    let Some(mut task) = ctx.store.get_json::<Task>(&task_key).await? else {
        warn!(task_id = %popped.member, "queued task record is missing, dropping");
        return Ok(StepOutcome::Idle);
    };

    if task.status == TaskStatus::Cancelled {
        return Ok(StepOutcome::Idle);
    }

    match ctx.breakers.gate(&task.task_type) {
        Gate::Open => {
            ctx.store.zadd(&queue_key, &popped.member, now + 1_000.0).await?;
            return Ok(StepOutcome::Requeued);
        }
        Gate::Closed | Gate::HalfOpen => {}
    }

    let old_status = task.status;
    task.status = TaskStatus::Running;
    task.attempts += 1;
    task.started_at = Some(Utc::now());
    ctx.store.set_json(&task_key, &task, None).await?;
    ctx.concurrency.enter();
    update_active_gauge(ctx.metrics, &task.task_type, Some(old_status), TaskStatus::Running);

    Ok(StepOutcome::Dispatched { task })
}

/// Record the outcome of a dispatch attempt started by [`step`]. Handles the
/// circuit breaker, retry/backoff, and terminal-failure bookkeeping.
pub async fn record_outcome(
    ctx: &SchedulingContext<'_>,
    mut task: Task,
    priority: Priority,
    dispatch_result: Result<String, String>,
) -> anyhow::Result<Task> {
    ctx.concurrency.leave();
    let task_key = Task::key(&task.id);

    match dispatch_result {
        Ok(workflow_id) => {
            task.workflow_id = Some(workflow_id);
            ctx.store.set_json(&task_key, &task, None).await?;
            ctx.breakers.record_success(&task.task_type);
            info!(task_id = %task.id, "dispatched");
        }
        Err(reason) => {
            ctx.breakers.record_failure(&task.task_type);
            if task.attempts < task.max_attempts {
                task.status = TaskStatus::Pending;
                let backoff = retry_backoff(ctx.config.retry_backoff_ms, task.attempts);
                let next_eligible = (Utc::now() + chrono::Duration::from_std(backoff)?).timestamp_millis() as f64;
                ctx.store.set_json(&task_key, &task, None).await?;
                ctx.store.zadd(&priority.queue_key(), &task.id, next_eligible).await?;
                update_active_gauge(ctx.metrics, &task.task_type, Some(TaskStatus::Running), TaskStatus::Pending);
                warn!(task_id = %task.id, attempts = task.attempts, %reason, "dispatch failed, retrying");
            } else {
                task.status = TaskStatus::Failed;
                task.completed_at = Some(Utc::now());
                ctx.store.set_json(&task_key, &task, None).await?;
                ctx.store.zadd("failed-tasks", &task.id, Utc::now().timestamp_millis() as f64).await?;
                update_active_gauge(ctx.metrics, &task.task_type, Some(TaskStatus::Running), TaskStatus::Failed);
                if let (Some(started_at), Some(completed_at)) = (task.started_at, task.completed_at) {
                    let duration = (completed_at - started_at).num_milliseconds().max(0) as f64 / 1000.0;
                    ctx.metrics.workflow_duration_seconds.with_label_values(&[&task.task_type]).observe(duration);
                }
                warn!(task_id = %task.id, %reason, "dispatch failed permanently");
            }
        }
    }

    Ok(task)
}
