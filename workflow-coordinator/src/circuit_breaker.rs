//! Per-task-type circuit breaker: trips open after a run of consecutive
//! failures, stays open for a cooldown window, then half-opens to let a
//! single probe through before closing again.

use chrono::Utc;
use config_manager::CircuitBreakerConfig;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::types::CircuitBreakerRecord;

pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    records: DashMap<String, Mutex<CircuitBreakerRecord>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Closed,
    /// Open and still within the cooldown window.
    Open,
    /// Open, cooldown elapsed: a single probe attempt may pass through.
    HalfOpen,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            records: DashMap::new(),
        }
    }

    /// Check whether a task of `task_type` is allowed to be dispatched.
    pub fn gate(&self, task_type: &str) -> Gate {
        let entry = self.records.entry(task_type.to_string()).or_default();
        let record = entry.lock();
        if !record.open {
            return Gate::Closed;
        }
        let elapsed = record
            .last_failure
            .map(|t| Utc::now().signed_duration_since(t).num_seconds())
            .unwrap_or(i64::MAX);
        if elapsed >= self.config.reset_timeout_seconds as i64 {
            Gate::HalfOpen
        } else {
            Gate::Open
        }
    }

    pub fn record_success(&self, task_type: &str) {
        if let Some(entry) = self.records.get(task_type) {
            let mut record = entry.lock();
            record.failure_count = 0;
            record.open = false;
            record.last_failure = None;
        }
    }

    /// Record a failure, tripping the breaker once the configured threshold
    /// of consecutive failures is reached.
    pub fn record_failure(&self, task_type: &str) {
        let entry = self.records.entry(task_type.to_string()).or_default();
        let mut record = entry.lock();
        record.failure_count += 1;
        record.last_failure = Some(Utc::now());
        if record.failure_count >= self.config.failure_threshold {
            record.open = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout_seconds: 60,
        }
    }

    #[test]
    fn closed_until_threshold_reached() {
        let registry = CircuitBreakerRegistry::new(cfg());
        registry.record_failure("training");
        registry.record_failure("training");
        assert_eq!(registry.gate("training"), Gate::Closed);
        registry.record_failure("training");
        assert_eq!(registry.gate("training"), Gate::Open);
    }

    #[test]
    fn success_resets_failure_count() {
        let registry = CircuitBreakerRegistry::new(cfg());
        registry.record_failure("training");
        registry.record_failure("training");
        registry.record_success("training");
        registry.record_failure("training");
        assert_eq!(registry.gate("training"), Gate::Closed);
    }

    #[test]
    fn unknown_task_type_gates_closed() {
        let registry = CircuitBreakerRegistry::new(cfg());
        assert_eq!(registry.gate("never-seen"), Gate::Closed);
    }
}
