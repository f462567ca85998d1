//! Dependency loop (§4.7): every 60 s, walk the declared `src -> tgt`
//! dependency edges and keep each target's `minReplicas` proportional to,
//! fixed against, or floored by its source's current replica count.

use orchestrator::OrchestratorClient;
use store::json_ext::KvStoreJsonExt;
use store::KvStore;
use tracing::warn;

use crate::types::{DependencyKind, ScalingDependency};

pub async fn load_dependencies(store: &dyn KvStore) -> anyhow::Result<Vec<ScalingDependency>> {
    let keys = store.scan_prefix("scaling-dependency:").await?;
    let mut dependencies = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(dependency) = store.get_json::<ScalingDependency>(&key).await? {
            dependencies.push(dependency);
        }
    }
    Ok(dependencies)
}

/// One tick: apply every enabled dependency. A single dependency's failure is
/// logged and does not abort the rest of the sweep.
pub async fn run_dependency_tick(store: &dyn KvStore, orchestrator: &dyn OrchestratorClient) -> anyhow::Result<()> {
    for dependency in load_dependencies(store).await? {
        if !dependency.enabled {
            continue;
        }
        if let Err(err) = apply_dependency(orchestrator, &dependency).await {
            warn!(
                source = %dependency.source_service,
                target = %dependency.target_service,
                %err,
                "dependency scaling failed"
            );
        }
    }
    Ok(())
}

async fn apply_dependency(orchestrator: &dyn OrchestratorClient, dependency: &ScalingDependency) -> anyhow::Result<()> {
    let source = orchestrator.read_autoscaler(&dependency.source_service).await?;
    let target = orchestrator.read_autoscaler(&dependency.target_service).await?;

    let desired = match dependency.kind {
        DependencyKind::Proportional { ratio } => (source.current_replicas as f64 * ratio).ceil() as i32,
        DependencyKind::Fixed { replicas } => replicas,
        DependencyKind::Minimum => target.current_replicas.max(target.min_replicas),
    };
    let clamped = desired.clamp(target.min_replicas, target.max_replicas);

    if clamped != target.current_replicas {
        orchestrator.patch_autoscaler_min(&dependency.target_service, clamped).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::fake::FakeOrchestratorClient;
    use orchestrator::types::AutoscalerSnapshot;
    use store::fake::InMemoryStore;

    fn snapshot(service: &str, current: i32, min: i32, max: i32) -> AutoscalerSnapshot {
        AutoscalerSnapshot {
            service: service.to_string(),
            current_replicas: current,
            desired_replicas: current,
            min_replicas: min,
            max_replicas: max,
            current_metrics: vec![],
            target_metrics: vec![],
        }
    }

    #[tokio::test]
    async fn proportional_dependency_scales_target_to_ratio_of_source() {
        let store = InMemoryStore::new();
        let orchestrator = FakeOrchestratorClient::new();
        orchestrator.seed_autoscaler(snapshot("a", 8, 1, 10));
        orchestrator.seed_autoscaler(snapshot("b", 2, 1, 10));

        let dependency = ScalingDependency {
            source_service: "a".into(),
            target_service: "b".into(),
            kind: DependencyKind::Proportional { ratio: 0.5 },
            enabled: true,
        };
        store.set_json(&ScalingDependency::key("a", "b"), &dependency, None).await.unwrap();

        run_dependency_tick(&store, &orchestrator).await.unwrap();

        let updated = orchestrator.read_autoscaler("b").await.unwrap();
        assert_eq!(updated.min_replicas, 4);
    }

    #[tokio::test]
    async fn disabled_dependency_is_skipped() {
        let store = InMemoryStore::new();
        let orchestrator = FakeOrchestratorClient::new();
        orchestrator.seed_autoscaler(snapshot("a", 8, 1, 10));
        orchestrator.seed_autoscaler(snapshot("b", 2, 1, 10));

        let dependency = ScalingDependency {
            source_service: "a".into(),
            target_service: "b".into(),
            kind: DependencyKind::Proportional { ratio: 0.5 },
            enabled: false,
        };
        store.set_json(&ScalingDependency::key("a", "b"), &dependency, None).await.unwrap();

        run_dependency_tick(&store, &orchestrator).await.unwrap();

        let updated = orchestrator.read_autoscaler("b").await.unwrap();
        assert_eq!(updated.min_replicas, 1);
    }

    #[tokio::test]
    async fn target_clamps_to_its_max_replicas() {
        let store = InMemoryStore::new();
        let orchestrator = FakeOrchestratorClient::new();
        orchestrator.seed_autoscaler(snapshot("a", 100, 1, 200));
        orchestrator.seed_autoscaler(snapshot("b", 2, 1, 10));

        let dependency = ScalingDependency {
            source_service: "a".into(),
            target_service: "b".into(),
            kind: DependencyKind::Fixed { replicas: 50 },
            enabled: true,
        };
        store.set_json(&ScalingDependency::key("a", "b"), &dependency, None).await.unwrap();

        run_dependency_tick(&store, &orchestrator).await.unwrap();

        let updated = orchestrator.read_autoscaler("b").await.unwrap();
        assert_eq!(updated.min_replicas, 10);
    }
}
