//! Predictive loop (§4.7): hourly, compute an expected-load-driven replica
//! prediction per service load pattern; every five minutes, apply the
//! confident ones by patching the target autoscaler's `minReplicas`.

use chrono::{DateTime, Datelike, Timelike, Utc};
use orchestrator::OrchestratorClient;
use store::json_ext::KvStoreJsonExt;
use store::KvStore;
use tracing::warn;

use crate::storage::append_capped;
use crate::types::{ScalingPrediction, ServiceLoadPattern};

const CONFIDENCE_APPLY_THRESHOLD: f64 = 0.7;
const HISTORY_CAP: usize = 100;

async fn load_patterns(store: &dyn KvStore) -> anyhow::Result<Vec<ServiceLoadPattern>> {
    let keys = store.scan_prefix("predictive-scaling:pattern:").await?;
    let mut patterns = Vec::with_capacity(keys.len());
    for key in keys {
        if let Some(pattern) = store.get_json::<ServiceLoadPattern>(&key).await? {
            patterns.push(pattern);
        }
    }
    Ok(patterns)
}

/// The fraction of the last `HISTORY_CAP` predictions for a service whose
/// predicted value lay within +/-1 of the replica count observed at the time
/// that prediction was made. Defaults per §4.7: 0.8 with no history, 0.5 if
/// the history itself could not be read.
async fn confidence_for(store: &dyn KvStore, service: &str) -> f64 {
    match store.get_json::<Vec<ScalingPrediction>>(&ScalingPrediction::history_key(service)).await {
        Ok(None) => 0.8,
        Ok(Some(history)) if history.is_empty() => 0.8,
        Ok(Some(history)) => {
            let within = history
                .iter()
                .filter(|p| (p.predicted_replicas - p.current_replicas_at_prediction).abs() <= 1)
                .count();
            within as f64 / history.len() as f64
        }
        Err(_) => 0.5,
    }
}

/// One hourly tick: emit (and persist) a prediction for every load pattern
/// with a matching window at `now`. Returns the predictions emitted, for
/// callers that want to log a count.
pub async fn run_predictive_tick(
    store: &dyn KvStore,
    orchestrator: &dyn OrchestratorClient,
    now: DateTime<Utc>,
) -> anyhow::Result<Vec<ScalingPrediction>> {
    let mut emitted = Vec::new();
    for pattern in load_patterns(store).await? {
        match predict_for_pattern(store, orchestrator, &pattern, now).await {
            Ok(Some(prediction)) => emitted.push(prediction),
            Ok(None) => {}
            Err(err) => warn!(service = %pattern.service, %err, "prediction failed"),
        }
    }
    Ok(emitted)
}

async fn predict_for_pattern(
    store: &dyn KvStore,
    orchestrator: &dyn OrchestratorClient,
    pattern: &ServiceLoadPattern,
    now: DateTime<Utc>,
) -> anyhow::Result<Option<ScalingPrediction>> {
    let day_of_week = now.weekday().num_days_from_sunday() as u8;
    let hour_of_day = now.hour() as u8;
    let minute_of_hour = now.minute() as u8;

    let expected_load = pattern
        .windows
        .iter()
        .filter(|w| w.matches(day_of_week, hour_of_day, minute_of_hour))
        .map(|w| w.expected_load)
        .fold(None, |max, load| Some(max.map_or(load, |m: f64| m.max(load))));

    let Some(expected_load) = expected_load else {
        return Ok(None);
    };

    let predicted_replicas =
        ((pattern.max_replicas as f64 * expected_load).ceil() as i32).clamp(pattern.min_replicas, pattern.max_replicas);
    let confidence = confidence_for(store, &pattern.service).await;

    let current_replicas_at_prediction = match orchestrator.read_autoscaler(&pattern.service).await {
        Ok(snapshot) => snapshot.current_replicas,
        Err(_) => pattern.min_replicas,
    };

    let prediction = ScalingPrediction {
        service: pattern.service.clone(),
        predicted_replicas,
        confidence,
        current_replicas_at_prediction,
        created_at: now,
        applied_at: None,
    };

    persist_prediction(store, &prediction).await?;
    Ok(Some(prediction))
}

async fn persist_prediction(store: &dyn KvStore, prediction: &ScalingPrediction) -> anyhow::Result<()> {
    append_capped(store, &ScalingPrediction::history_key(&prediction.service), prediction.clone(), HISTORY_CAP).await?;

    let mut pending = store
        .get_json::<Vec<ScalingPrediction>>(&ScalingPrediction::pending_key(&prediction.service))
        .await?
        .unwrap_or_default();
    pending.push(prediction.clone());
    store.set_json(&ScalingPrediction::pending_key(&prediction.service), &pending, None).await?;
    Ok(())
}

/// One five-minute apply tick: patch the autoscaler for every pending
/// prediction whose confidence clears the threshold, then mark it applied.
/// Returns the number of predictions applied.
pub async fn run_apply_tick(store: &dyn KvStore, orchestrator: &dyn OrchestratorClient) -> anyhow::Result<usize> {
    let mut applied_count = 0;
    for key in store.scan_prefix("predictive-scaling:prediction:").await? {
        let Some(pending) = store.get_json::<Vec<ScalingPrediction>>(&key).await? else { continue };
        if pending.is_empty() {
            continue;
        }

        let mut remaining = Vec::with_capacity(pending.len());
        for mut prediction in pending {
            if prediction.applied_at.is_none() && prediction.confidence >= CONFIDENCE_APPLY_THRESHOLD {
                match orchestrator.patch_autoscaler_min(&prediction.service, prediction.predicted_replicas).await {
                    Ok(()) => {
                        prediction.applied_at = Some(Utc::now());
                        applied_count += 1;
                        mark_applied_in_history(store, &prediction).await?;
                        continue;
                    }
                    Err(err) => {
                        warn!(service = %prediction.service, %err, "failed to apply scaling prediction");
                    }
                }
            }
            remaining.push(prediction);
        }
        store.set_json(&key, &remaining, None).await?;
    }
    Ok(applied_count)
}

async fn mark_applied_in_history(store: &dyn KvStore, prediction: &ScalingPrediction) -> anyhow::Result<()> {
    let key = ScalingPrediction::history_key(&prediction.service);
    if let Some(mut history) = store.get_json::<Vec<ScalingPrediction>>(&key).await? {
        if let Some(entry) = history.iter_mut().find(|p| p.created_at == prediction.created_at) {
            entry.applied_at = prediction.applied_at;
        }
        store.set_json(&key, &history, None).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LoadWindow;
    use chrono::TimeZone;
    use orchestrator::fake::FakeOrchestratorClient;
    use orchestrator::types::AutoscalerSnapshot;
    use store::fake::InMemoryStore;

    fn monday_nine_am() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap()
    }

    fn seed_pattern(store: &InMemoryStore, service: &str) {
        let pattern = ServiceLoadPattern {
            service: service.to_string(),
            windows: vec![LoadWindow { day_of_week: Some(1), hour_of_day: Some(9), minute_of_hour: None, expected_load: 0.9 }],
            min_replicas: 1,
            max_replicas: 10,
        };
        futures::executor::block_on(store.set_json(&ServiceLoadPattern::key(service), &pattern, None)).unwrap();
    }

    #[tokio::test]
    async fn empty_matching_window_set_emits_no_prediction() {
        let store = InMemoryStore::new();
        let orchestrator = FakeOrchestratorClient::new();
        seed_pattern(&store, "svc");

        let noon = Utc.with_ymd_and_hms(2026, 1, 5, 12, 0, 0).unwrap();
        let predictions = run_predictive_tick(&store, &orchestrator, noon).await.unwrap();
        assert!(predictions.is_empty());
    }

    #[tokio::test]
    async fn matching_window_emits_prediction_scaled_by_expected_load() {
        let store = InMemoryStore::new();
        let orchestrator = FakeOrchestratorClient::new();
        seed_pattern(&store, "svc");

        let predictions = run_predictive_tick(&store, &orchestrator, monday_nine_am()).await.unwrap();
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].predicted_replicas, 9);
    }

    #[tokio::test]
    async fn confident_pending_prediction_is_applied_and_marked() {
        let store = InMemoryStore::new();
        let orchestrator = FakeOrchestratorClient::new();
        orchestrator.seed_autoscaler(AutoscalerSnapshot {
            service: "svc".into(),
            current_replicas: 1,
            desired_replicas: 1,
            min_replicas: 1,
            max_replicas: 10,
            current_metrics: vec![],
            target_metrics: vec![],
        });

        // Nine prior predictions within +/-1 of the observed replica count,
        // one outlier, giving confidence 0.9 -- above the 0.7 apply threshold.
        let mut history = Vec::new();
        for i in 0..10 {
            history.push(ScalingPrediction {
                service: "svc".into(),
                predicted_replicas: 9,
                confidence: 0.0,
                current_replicas_at_prediction: if i == 9 { 20 } else { 9 },
                created_at: monday_nine_am() - chrono::Duration::hours(i + 1),
                applied_at: None,
            });
        }
        store.set_json(&ScalingPrediction::history_key("svc"), &history, None).await.unwrap();

        let predictions = run_predictive_tick(&store, &orchestrator, monday_nine_am()).await.unwrap();
        assert_eq!(predictions.len(), 1);
        assert!((predictions[0].confidence - 0.9).abs() < 1e-9);

        let applied = run_apply_tick(&store, &orchestrator).await.unwrap();
        assert_eq!(applied, 1);

        let updated = orchestrator.read_autoscaler("svc").await.unwrap();
        assert_eq!(updated.min_replicas, 9);

        let pending = store.get_json::<Vec<ScalingPrediction>>(&ScalingPrediction::pending_key("svc")).await.unwrap().unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn low_confidence_prediction_is_not_applied() {
        let store = InMemoryStore::new();
        let orchestrator = FakeOrchestratorClient::new();
        orchestrator.seed_autoscaler(AutoscalerSnapshot {
            service: "svc".into(),
            current_replicas: 1,
            desired_replicas: 1,
            min_replicas: 1,
            max_replicas: 10,
            current_metrics: vec![],
            target_metrics: vec![],
        });

        run_predictive_tick(&store, &orchestrator, monday_nine_am()).await.unwrap();
        let applied = run_apply_tick(&store, &orchestrator).await.unwrap();
        assert_eq!(applied, 0);

        let updated = orchestrator.read_autoscaler("svc").await.unwrap();
        assert_eq!(updated.min_replicas, 1);
    }
}
