//! Black-box coverage of the dependency and predictive loops driven through
//! their public one-tick entry points, against the in-memory fakes, mirroring
//! how the in-module unit tests already exercise `apply_dependency` and
//! `predict_for_pattern` but across a whole tick instead of one call.

use autoscaler::dependency::run_dependency_tick;
use autoscaler::predictive::run_apply_tick;
use autoscaler::types::{DependencyKind, ScalingDependency, ScalingPrediction};
use chrono::Utc;
use orchestrator::fake::FakeOrchestratorClient;
use orchestrator::types::AutoscalerSnapshot;
use orchestrator::OrchestratorClient;
use store::json_ext::KvStoreJsonExt;
use store::fake::InMemoryStore;

fn snapshot(service: &str, current: i32, min: i32, max: i32) -> AutoscalerSnapshot {
    AutoscalerSnapshot {
        service: service.to_string(),
        current_replicas: current,
        desired_replicas: current,
        min_replicas: min,
        max_replicas: max,
        current_metrics: Vec::new(),
        target_metrics: Vec::new(),
    }
}

#[tokio::test]
async fn dependency_tick_scales_target_proportionally_to_source() {
    let store = InMemoryStore::new();
    let orchestrator = FakeOrchestratorClient::new();
    orchestrator.seed_autoscaler(snapshot("ingest", 10, 1, 20));
    orchestrator.seed_autoscaler(snapshot("worker", 1, 1, 20));

    let dependency = ScalingDependency {
        source_service: "ingest".to_string(),
        target_service: "worker".to_string(),
        kind: DependencyKind::Proportional { ratio: 0.5 },
        enabled: true,
    };
    store
        .set_json(&ScalingDependency::key("ingest", "worker"), &dependency, None)
        .await
        .unwrap();

    run_dependency_tick(&store, &orchestrator).await.unwrap();

    let worker = orchestrator.read_autoscaler("worker").await.unwrap();
    assert_eq!(worker.current_replicas, 5);
}

#[tokio::test]
async fn dependency_tick_skips_disabled_dependencies() {
    let store = InMemoryStore::new();
    let orchestrator = FakeOrchestratorClient::new();
    orchestrator.seed_autoscaler(snapshot("ingest", 10, 1, 20));
    orchestrator.seed_autoscaler(snapshot("worker", 1, 1, 20));

    let dependency = ScalingDependency {
        source_service: "ingest".to_string(),
        target_service: "worker".to_string(),
        kind: DependencyKind::Fixed { replicas: 9 },
        enabled: false,
    };
    store
        .set_json(&ScalingDependency::key("ingest", "worker"), &dependency, None)
        .await
        .unwrap();

    run_dependency_tick(&store, &orchestrator).await.unwrap();

    let worker = orchestrator.read_autoscaler("worker").await.unwrap();
    assert_eq!(worker.current_replicas, 1);
}

#[tokio::test]
async fn confident_prediction_is_applied_and_marked() {
    let store = InMemoryStore::new();
    let orchestrator = FakeOrchestratorClient::new();
    orchestrator.seed_autoscaler(snapshot("renderer", 2, 1, 20));

    let prediction = ScalingPrediction {
        service: "renderer".to_string(),
        predicted_replicas: 8,
        confidence: 0.9,
        current_replicas_at_prediction: 2,
        created_at: Utc::now(),
        applied_at: None,
    };
    store
        .set_json(&ScalingPrediction::pending_key("renderer"), &vec![prediction], None)
        .await
        .unwrap();

    let applied = run_apply_tick(&store, &orchestrator).await.unwrap();
    assert_eq!(applied, 1);

    let renderer = orchestrator.read_autoscaler("renderer").await.unwrap();
    assert_eq!(renderer.current_replicas, 8);
}
