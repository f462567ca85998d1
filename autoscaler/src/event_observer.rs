//! Scaling-event observer (§4.7): every 30 s, list every autoscaler, classify
//! what it just did, and persist a debounced, bounded log of the result for
//! later effectiveness analysis.

use std::time::Duration;

use chrono::{DateTime, Utc};
use orchestrator::types::{AutoscalerSnapshot, MetricSnapshot};
use orchestrator::OrchestratorClient;
use store::json_ext::KvStoreJsonExt;
use store::KvStore;
use tracing::warn;

use crate::storage::append_capped;
use crate::types::{ScalingEvent, ScalingEventKind};

const SERVICE_LIST_CAP: usize = 100;
const GLOBAL_LIST_CAP: usize = 1000;
const EFFECTIVENESS_CAP: usize = 100;
const DEBOUNCE: Duration = Duration::from_secs(300);

/// One 30-second tick: observe every autoscaler, classify its event, and
/// persist a debounced record. A single service's failure is logged and does
/// not abort the sweep. Returns the events actually logged (post-debounce).
pub async fn run_observer_tick(
    store: &dyn KvStore,
    orchestrator: &dyn OrchestratorClient,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<ScalingEvent>> {
    let mut logged = Vec::new();
    for service in orchestrator.list_autoscaler_services().await? {
        match observe_service(store, orchestrator, &service, now).await {
            Ok(Some(event)) => logged.push(event),
            Ok(None) => {}
            Err(err) => warn!(%service, %err, "scaling-event observation failed"),
        }
    }
    Ok(logged)
}

async fn observe_service(
    store: &dyn KvStore,
    orchestrator: &dyn OrchestratorClient,
    service: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<ScalingEvent>> {
    let snapshot = orchestrator.read_autoscaler(service).await?;
    let available = orchestrator.deployment_available_replicas(service).await.unwrap_or(snapshot.current_replicas);

    let event = classify(&snapshot, available, now);
    record_effectiveness(store, service, &event).await?;

    let debounce_key = ScalingEvent::debounce_key(service);
    if !store.set_if_absent(&debounce_key, b"1", Some(DEBOUNCE)).await? {
        return Ok(None);
    }

    append_capped(store, &ScalingEvent::service_list_key(service), event.clone(), SERVICE_LIST_CAP).await?;
    append_capped(store, ScalingEvent::global_list_key(), event.clone(), GLOBAL_LIST_CAP).await?;
    Ok(Some(event))
}

fn classify(snapshot: &AutoscalerSnapshot, available: i32, now: DateTime<Utc>) -> ScalingEvent {
    let kind = if snapshot.desired_replicas > available {
        ScalingEventKind::LimitedScale
    } else if snapshot.desired_replicas > snapshot.current_replicas {
        ScalingEventKind::Up
    } else if snapshot.desired_replicas < snapshot.current_replicas {
        ScalingEventKind::Down
    } else {
        ScalingEventKind::NoScale
    };

    let (metric_name, metric_value, metric_threshold) = driving_metric(snapshot);

    ScalingEvent {
        service: snapshot.service.clone(),
        kind,
        current_replicas: snapshot.current_replicas,
        desired_replicas: snapshot.desired_replicas,
        available_replicas: available,
        metric_name,
        metric_value,
        metric_threshold,
        timestamp: now,
    }
}

/// Pick the metric that best explains the scaling decision: the current
/// metric whose value is proportionally furthest from its target, matched
/// against the spec's metric of the same name for its threshold. Resource,
/// pods, object and external metrics are all read uniformly by name.
fn driving_metric(snapshot: &AutoscalerSnapshot) -> (Option<String>, Option<f64>, Option<f64>) {
    let mut best: Option<(&MetricSnapshot, f64)> = None;
    for current in &snapshot.current_metrics {
        let Some(value) = current.current_value else { continue };
        let target = snapshot
            .target_metrics
            .iter()
            .find(|m| m.name == current.name && m.kind == current.kind)
            .and_then(|m| m.target_value)
            .or(current.target_value);
        let Some(target) = target else { continue };
        if target <= 0.0 {
            continue;
        }
        let ratio = (value / target - 1.0).abs();
        if best.map_or(true, |(_, best_ratio)| ratio > best_ratio) {
            best = Some((current, ratio));
        }
    }
    match best {
        Some((metric, _)) => {
            let threshold = snapshot
                .target_metrics
                .iter()
                .find(|m| m.name == metric.name && m.kind == metric.kind)
                .and_then(|m| m.target_value)
                .or(metric.target_value);
            (Some(metric.name.clone()), metric.current_value, threshold)
        }
        None => (None, None, None),
    }
}

async fn record_effectiveness(store: &dyn KvStore, service: &str, event: &ScalingEvent) -> anyhow::Result<()> {
    let effective = if event.desired_replicas == event.available_replicas { 1u8 } else { 0u8 };
    append_capped(store, &ScalingEvent::effectiveness_key(service), effective, EFFECTIVENESS_CAP).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator::fake::FakeOrchestratorClient;

    fn base_snapshot(service: &str, current: i32, desired: i32) -> AutoscalerSnapshot {
        AutoscalerSnapshot {
            service: service.to_string(),
            current_replicas: current,
            desired_replicas: desired,
            min_replicas: 1,
            max_replicas: 10,
            current_metrics: vec![],
            target_metrics: vec![],
        }
    }

    #[test]
    fn classifies_limited_scale_when_desired_exceeds_available() {
        let snapshot = base_snapshot("svc", 2, 5);
        let event = classify(&snapshot, 3, Utc::now());
        assert_eq!(event.kind, ScalingEventKind::LimitedScale);
    }

    #[test]
    fn classifies_up_down_and_no_scale() {
        let now = Utc::now();
        assert_eq!(classify(&base_snapshot("s", 2, 5), 5, now).kind, ScalingEventKind::Up);
        assert_eq!(classify(&base_snapshot("s", 5, 2), 5, now).kind, ScalingEventKind::Down);
        assert_eq!(classify(&base_snapshot("s", 3, 3), 3, now).kind, ScalingEventKind::NoScale);
    }

    #[tokio::test]
    async fn second_observation_within_window_is_debounced() {
        let store = store::fake::InMemoryStore::new();
        let orchestrator = FakeOrchestratorClient::new();
        orchestrator.seed_autoscaler(base_snapshot("svc", 2, 5));
        orchestrator.set_deployment_available("svc", 5);

        let now = Utc::now();
        let first = run_observer_tick(&store, &orchestrator, now).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = run_observer_tick(&store, &orchestrator, now).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn effectiveness_recorded_regardless_of_debounce() {
        let store = store::fake::InMemoryStore::new();
        let orchestrator = FakeOrchestratorClient::new();
        orchestrator.seed_autoscaler(base_snapshot("svc", 2, 2));
        orchestrator.set_deployment_available("svc", 2);

        run_observer_tick(&store, &orchestrator, Utc::now()).await.unwrap();
        run_observer_tick(&store, &orchestrator, Utc::now()).await.unwrap();

        let effectiveness: Vec<u8> =
            store.get_json(&ScalingEvent::effectiveness_key("svc")).await.unwrap().unwrap();
        assert_eq!(effectiveness, vec![1, 1]);
    }
}
