//! In-process counters, histograms and gauges, and their textual export.
//!
//! Label cardinality is bounded by priority and task type (both small finite
//! sets); user id is deliberately never used as a label, per the design note
//! in the spec about omitting or hashing free-form identifiers.

use anyhow::{Context, Result};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

const DURATION_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

pub struct CoordinatorMetrics {
    registry: Registry,
    pub workflow_completed_total: IntCounterVec,
    pub workflow_error_total: IntCounterVec,
    pub workflow_cache_hit_total: IntCounterVec,
    pub workflow_cancelled_total: IntCounterVec,
    pub workflow_duration_seconds: HistogramVec,
    pub queue_depth: IntGaugeVec,
    pub active_workflows: IntGaugeVec,
    pub resource_utilization: IntGaugeVec,
}

impl CoordinatorMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let workflow_completed_total = IntCounterVec::new(
            Opts::new("workflow_completed_total", "Workflows that reached COMPLETED"),
            &["task_type"],
        )?;
        let workflow_error_total = IntCounterVec::new(
            Opts::new("workflow_error_total", "Workflows that reached FAILED"),
            &["task_type"],
        )?;
        let workflow_cache_hit_total = IntCounterVec::new(
            Opts::new("workflow_cache_hit_total", "Submissions short-circuited by the result cache"),
            &["task_type"],
        )?;
        let workflow_cancelled_total = IntCounterVec::new(
            Opts::new("workflow_cancelled_total", "Tasks cancelled before or during execution"),
            &["task_type"],
        )?;
        let workflow_duration_seconds = HistogramVec::new(
            HistogramOpts::new("workflow_duration_seconds", "Dispatch-to-terminal duration")
                .buckets(DURATION_BUCKETS.to_vec()),
            &["task_type"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("queue_depth", "Pending entries in a priority queue"),
            &["priority"],
        )?;
        let active_workflows = IntGaugeVec::new(
            Opts::new("active_workflows", "Non-terminal workflows by type and status"),
            &["task_type", "status"],
        )?;
        let resource_utilization = IntGaugeVec::new(
            Opts::new("resource_utilization", "Utilisation percent (0-100) by resource dimension"),
            &["resource"],
        )?;

        for collector in [
            Box::new(workflow_completed_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(workflow_error_total.clone()),
            Box::new(workflow_cache_hit_total.clone()),
            Box::new(workflow_cancelled_total.clone()),
            Box::new(workflow_duration_seconds.clone()),
            Box::new(queue_depth.clone()),
            Box::new(active_workflows.clone()),
            Box::new(resource_utilization.clone()),
        ] {
            registry.register(collector).context("register collector")?;
        }

        Ok(Self {
            registry,
            workflow_completed_total,
            workflow_error_total,
            workflow_cache_hit_total,
            workflow_cancelled_total,
            workflow_duration_seconds,
            queue_depth,
            active_workflows,
            resource_utilization,
        })
    }

    /// Render the full registry as Prometheus text exposition format.
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("encode metrics")?;
        String::from_utf8(buffer).context("metrics text is not valid utf8")
    }
}

impl Default for CoordinatorMetrics {
    fn default() -> Self {
        Self::new().expect("static metric definitions are valid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metric_names() {
        let metrics = CoordinatorMetrics::new().unwrap();
        metrics.workflow_completed_total.with_label_values(&["workflow"]).inc();
        metrics.queue_depth.with_label_values(&["HIGH"]).set(3);

        let text = metrics.render().unwrap();
        assert!(text.contains("workflow_completed_total"));
        assert!(text.contains("queue_depth"));
    }
}
