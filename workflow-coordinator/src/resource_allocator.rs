//! Translates a quality tier, priority, and subscription into a concrete
//! resource allocation, shaving capacity under pressure and enforcing a
//! per-subscription ceiling.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use coordinator_metrics::CoordinatorMetrics;
use orchestrator::OrchestratorClient;
use store::KvStore;
use tokio::sync::watch;
use tracing::error;

use crate::types::{Priority, QualityTier, ResourceAllocation, SubscriptionTier};

#[derive(Debug, Clone, Copy)]
struct BaseRow {
    cpu_millicores: u64,
    memory_bytes: u64,
    gpu_count: u32,
    node_type: &'static str,
    gpu_type: Option<&'static str>,
}

const GI: u64 = 1024 * 1024 * 1024;
const MI: u64 = 1024 * 1024;

fn base_row(tier: QualityTier) -> BaseRow {
    match tier {
        QualityTier::Low => BaseRow {
            cpu_millicores: 500,
            memory_bytes: 2 * GI,
            gpu_count: 0,
            node_type: "cpu-optimized",
            gpu_type: None,
        },
        QualityTier::Medium => BaseRow {
            cpu_millicores: 2000,
            memory_bytes: 8 * GI,
            gpu_count: 1,
            node_type: "gpu-optimized",
            gpu_type: Some("t4"),
        },
        QualityTier::High => BaseRow {
            cpu_millicores: 4000,
            memory_bytes: 16 * GI,
            gpu_count: 2,
            node_type: "gpu-optimized",
            gpu_type: Some("a100"),
        },
    }
}

fn node_selector(node_type: &'static str, gpu_type: Option<&'static str>) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    selector.insert("node-type".to_string(), node_type.to_string());
    if let Some(gpu_type) = gpu_type {
        selector.insert("gpu-type".to_string(), gpu_type.to_string());
    }
    selector
}

pub fn validate_quality_for_subscription(tier: QualityTier, subscription: SubscriptionTier) -> bool {
    tier.is_allowed_for(subscription)
}

pub fn highest_allowed_quality(subscription: SubscriptionTier) -> QualityTier {
    QualityTier::highest_allowed(subscription)
}

/// Relative priority used by the orchestrator for `priorityClassName`
/// selection: higher subscriptions and priorities get a bigger number.
pub fn priority_value_for(priority: Priority, subscription: SubscriptionTier) -> u32 {
    let priority_component = match priority {
        Priority::High => 300,
        Priority::Medium => 200,
        Priority::Low => 100,
        Priority::Batch => 0,
    };
    let subscription_component = match subscription {
        SubscriptionTier::Premium => 30,
        SubscriptionTier::Standard => 20,
        SubscriptionTier::Free => 10,
    };
    priority_component + subscription_component
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Utilization {
    pub cpu: f64,
    pub memory: f64,
    pub gpu: f64,
}

const PRESSURE_THRESHOLD: f64 = 0.8;

pub struct ResourceAllocator {
    store: Arc<dyn KvStore>,
}

impl ResourceAllocator {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    async fn read_utilization(&self) -> Utilization {
        Utilization {
            cpu: self.read_dimension("cpu").await,
            memory: self.read_dimension("memory").await,
            gpu: self.read_dimension("gpu").await,
        }
    }

    async fn read_dimension(&self, dimension: &str) -> f64 {
        match self.store.get(&format!("resources:{dimension}:utilization")).await {
            Ok(Some(bytes)) => std::str::from_utf8(&bytes).ok().and_then(|s| s.parse().ok()).unwrap_or(0.6),
            _ => 0.6,
        }
    }

    pub async fn allocate(&self, tier: QualityTier, priority: Priority, subscription: SubscriptionTier) -> ResourceAllocation {
        let utilization = self.read_utilization().await;
        allocate_with_utilization(tier, priority, subscription, utilization)
    }
}

fn scale_cpu(millicores: u64, factor: f64) -> u64 {
    ((millicores as f64 * factor).round() as u64).max(100)
}

fn scale_memory_bytes(bytes: u64, factor: f64, unit_is_gi: bool) -> u64 {
    let scaled = (bytes as f64 * factor).round() as u64;
    let floor = if unit_is_gi { GI } else { 256 * MI };
    scaled.max(floor)
}

fn allocate_with_utilization(
    tier: QualityTier,
    priority: Priority,
    subscription: SubscriptionTier,
    utilization: Utilization,
) -> ResourceAllocation {
    let tier = if !tier.is_allowed_for(subscription) {
        QualityTier::highest_allowed(subscription)
    } else {
        tier
    };
    let row = base_row(tier);

    let mut cpu = row.cpu_millicores;
    let mut memory = row.memory_bytes;
    let mut gpu = row.gpu_count;
    let mut node_type = row.node_type;
    let mut gpu_type = row.gpu_type;

    let cpu_pressure = utilization.cpu > PRESSURE_THRESHOLD;
    let memory_pressure = utilization.memory > PRESSURE_THRESHOLD;
    let gpu_pressure = utilization.gpu > PRESSURE_THRESHOLD;
    // Rows built from GI stay floored to a GI minimum; the low-tier row
    // (memory measured in the same units) still floors at 256 Mi per spec.
    let memory_unit_is_gi = tier != QualityTier::Low;

    match priority {
        Priority::High => {}
        Priority::Medium => {
            if cpu_pressure {
                cpu = scale_cpu(cpu, 0.75);
            }
            if memory_pressure {
                memory = scale_memory_bytes(memory, 0.75, memory_unit_is_gi);
            }
            if gpu_pressure {
                gpu = ((gpu as f64) * 0.75).round() as u32;
            }
        }
        Priority::Low | Priority::Batch => {
            if cpu_pressure {
                cpu = scale_cpu(cpu, 0.5);
            }
            if memory_pressure {
                memory = scale_memory_bytes(memory, 0.5, memory_unit_is_gi);
            }
            if gpu_pressure {
                if tier != QualityTier::High {
                    gpu = 0;
                    node_type = "cpu-optimized";
                    gpu_type = None;
                } else {
                    gpu = ((gpu as f64) * 0.5).round() as u32;
                }
            }
        }
    }

    if subscription == SubscriptionTier::Free && (cpu_pressure || memory_pressure || gpu_pressure) {
        let low = base_row(QualityTier::Low);
        cpu = low.cpu_millicores;
        memory = low.memory_bytes;
        gpu = 0;
        node_type = "cpu-optimized";
        gpu_type = None;
    }

    ResourceAllocation {
        cpu_millicores: cpu,
        memory_bytes: memory,
        gpu_count: gpu,
        node_selector: node_selector(node_type, gpu_type),
    }
}

/// Cluster-wide capacity/usage, aggregated across nodes by the caller (the
/// resource-utilisation updater in the `coordinator` binary polls node
/// metrics and feeds the totals in here).
#[derive(Debug, Clone, Copy, Default)]
pub struct ClusterCapacity {
    pub cpu_used_millicores: u64,
    pub cpu_total_millicores: u64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub gpu_used: u64,
    pub gpu_total: u64,
}

impl From<orchestrator::ClusterResourceSnapshot> for ClusterCapacity {
    fn from(snapshot: orchestrator::ClusterResourceSnapshot) -> Self {
        Self {
            cpu_used_millicores: snapshot.cpu_used_millicores,
            cpu_total_millicores: snapshot.cpu_total_millicores,
            memory_used_bytes: snapshot.memory_used_bytes,
            memory_total_bytes: snapshot.memory_total_bytes,
            gpu_used: snapshot.gpu_used,
            gpu_total: snapshot.gpu_total,
        }
    }
}

const RESOURCE_KEY_TTL_SECONDS: u64 = 5 * 60;

fn ratio(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        (used as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// Compute utilisation/availability for cpu, memory, and gpu, write all six
/// `resources:{dimension}:{utilization,availability}` keys with a 5-minute
/// TTL, and set the `resource_utilization{resource}` gauge alongside them.
pub async fn update_resource_availability(
    store: &dyn KvStore,
    metrics: &CoordinatorMetrics,
    capacity: ClusterCapacity,
) -> anyhow::Result<()> {
    let ttl = std::time::Duration::from_secs(RESOURCE_KEY_TTL_SECONDS);
    for (dimension, utilization) in [
        ("cpu", ratio(capacity.cpu_used_millicores, capacity.cpu_total_millicores)),
        ("memory", ratio(capacity.memory_used_bytes, capacity.memory_total_bytes)),
        ("gpu", ratio(capacity.gpu_used, capacity.gpu_total)),
    ] {
        let availability = 1.0 - utilization;
        store
            .set(&format!("resources:{dimension}:utilization"), utilization.to_string().into_bytes(), Some(ttl))
            .await?;
        store
            .set(&format!("resources:{dimension}:availability"), availability.to_string().into_bytes(), Some(ttl))
            .await?;
        metrics.resource_utilization.with_label_values(&[dimension]).set((utilization * 100.0).round() as i64);
    }
    Ok(())
}

const RESOURCE_METRICS_TICK_SECONDS: u64 = 5 * 60;

/// Long-lived resource-utilisation updater (§4.5): every 5 minutes, read
/// node/pod capacity from the orchestrator and republish the per-dimension
/// utilisation/availability keys the allocator reads on every dispatch.
pub async fn run_resource_metrics_loop(
    store: Arc<dyn KvStore>,
    orchestrator: Arc<dyn OrchestratorClient>,
    metrics: Arc<CoordinatorMetrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(RESOURCE_METRICS_TICK_SECONDS));
    loop {
        if *shutdown.borrow() {
            return;
        }
        tokio::select! {
            _ = shutdown.changed() => continue,
            _ = ticker.tick() => {
                match orchestrator.cluster_resource_snapshot().await {
                    Ok(snapshot) => {
                        if let Err(err) = update_resource_availability(store.as_ref(), metrics.as_ref(), snapshot.into()).await {
                            error!(%err, "failed to persist resource availability");
                        }
                    }
                    Err(err) => error!(%err, "failed to read cluster resource snapshot"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_priority_never_downgrades_under_pressure() {
        let allocation = allocate_with_utilization(
            QualityTier::Medium,
            Priority::High,
            SubscriptionTier::Premium,
            Utilization { cpu: 0.95, memory: 0.95, gpu: 0.95 },
        );
        assert_eq!(allocation.cpu_millicores, 2000);
        assert_eq!(allocation.gpu_count, 1);
    }

    #[test]
    fn low_priority_under_gpu_pressure_drops_to_cpu_optimized() {
        let allocation = allocate_with_utilization(
            QualityTier::Medium,
            Priority::Low,
            SubscriptionTier::Premium,
            Utilization { cpu: 0.5, memory: 0.5, gpu: 0.95 },
        );
        assert_eq!(allocation.gpu_count, 0);
        assert_eq!(allocation.node_selector.get("node-type"), Some(&"cpu-optimized".to_string()));
    }

    #[test]
    fn free_subscription_under_pressure_forces_low_tier() {
        let allocation = allocate_with_utilization(
            QualityTier::High,
            Priority::Medium,
            SubscriptionTier::Free,
            Utilization { cpu: 0.9, memory: 0.5, gpu: 0.5 },
        );
        assert_eq!(allocation.cpu_millicores, 500);
        assert_eq!(allocation.gpu_count, 0);
    }

    #[test]
    fn cpu_floor_is_respected() {
        let allocation = allocate_with_utilization(
            QualityTier::Low,
            Priority::Low,
            SubscriptionTier::Standard,
            Utilization { cpu: 0.99, memory: 0.1, gpu: 0.1 },
        );
        assert!(allocation.cpu_millicores >= 100);
    }

    #[test]
    fn priority_value_orders_high_priority_above_low_regardless_of_subscription() {
        assert!(
            priority_value_for(Priority::High, SubscriptionTier::Free)
                > priority_value_for(Priority::Low, SubscriptionTier::Premium)
        );
    }

    #[tokio::test]
    async fn updater_writes_utilization_and_availability_as_complements() {
        let store = store::fake::InMemoryStore::new();
        let metrics = CoordinatorMetrics::new().unwrap();
        update_resource_availability(
            &store,
            &metrics,
            ClusterCapacity {
                cpu_used_millicores: 3000,
                cpu_total_millicores: 4000,
                memory_used_bytes: 1,
                memory_total_bytes: 2,
                gpu_used: 0,
                gpu_total: 8,
            },
        )
        .await
        .unwrap();

        let util = store.get("resources:cpu:utilization").await.unwrap().unwrap();
        let avail = store.get("resources:cpu:availability").await.unwrap().unwrap();
        assert_eq!(std::str::from_utf8(&util).unwrap(), "0.75");
        assert_eq!(std::str::from_utf8(&avail).unwrap(), "0.25");

        let text = metrics.render().unwrap();
        assert!(text.contains("resource_utilization"));
    }
}
