//! Decides which quality tier a request should run at: an explicit target
//! honoured when the subscription allows it, otherwise a five-factor
//! weighted assessment.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use store::KvStore;

use crate::types::{ParamValue, Parameters, QualityAssessment, QualityPreference, QualityRequest, QualityTier, SubscriptionTier};

const HISTORY_TTL: Duration = Duration::from_secs(30 * 24 * 3600);

pub struct QualityAssessor {
    store: Arc<dyn KvStore>,
}

fn bucket(value: f64, low: f64, high: f64) -> f64 {
    if value <= low {
        0.25
    } else if value <= high {
        0.5
    } else {
        0.75
    }
}

fn param_f64(parameters: &Parameters, key: &str) -> Option<f64> {
    parameters.get(key).and_then(ParamValue::as_f64)
}

fn param_str<'a>(parameters: &'a Parameters, key: &str) -> Option<&'a str> {
    parameters.get(key).and_then(ParamValue::as_str)
}

fn param_bool(parameters: &Parameters, key: &str) -> bool {
    parameters.get(key).and_then(ParamValue::as_bool).unwrap_or(false)
}

/// Per-task-type {size, complexity} -> {0.25, 0.5, 0.75} bucket, averaged.
fn input_factor(task_type: &str, parameters: &Parameters) -> f64 {
    let (size, complexity) = match task_type {
        "3d-reconstruction" => {
            let images = param_f64(parameters, "image-count").unwrap_or(0.0);
            let size = bucket(images, 5.0, 20.0);
            let complexity = param_f64(parameters, "scene-complexity").unwrap_or(0.5);
            (size, complexity.clamp(0.0, 1.0))
        }
        "material-recognition" => {
            let resolution = param_f64(parameters, "resolution").unwrap_or(0.0);
            let size = bucket(resolution, 512.0, 2048.0);
            let complexity = if param_bool(parameters, "extract-properties") { 0.75 } else { 0.5 };
            (size, complexity)
        }
        "scene-graph" => {
            let max_objects = param_f64(parameters, "max-objects").unwrap_or(0.0);
            let size = bucket(max_objects, 10.0, 50.0);
            let relationship_detail = param_f64(parameters, "relationship-detail").unwrap_or(0.5);
            (size, relationship_detail.clamp(0.0, 1.0))
        }
        "room-layout" => {
            let room_type = param_str(parameters, "room-type").unwrap_or("");
            let complexity = match room_type {
                "kitchen" | "bathroom" | "office" => 0.75,
                "bedroom" | "living" => 0.5,
                _ => 0.25,
            };
            let room_size = param_f64(parameters, "room-size").unwrap_or(0.0);
            let size = bucket(room_size, 30.0, 80.0);
            (size, complexity)
        }
        _ => (0.5, 0.5),
    };
    (size + complexity) / 2.0
}

async fn resource_factor(store: &Arc<dyn KvStore>) -> f64 {
    let cpu = read_availability(store, "cpu").await;
    let memory = read_availability(store, "memory").await;
    let gpu = read_availability(store, "gpu").await;
    0.3 * cpu + 0.3 * memory + 0.4 * gpu
}

async fn read_availability(store: &Arc<dyn KvStore>, dimension: &str) -> f64 {
    match store.get(&format!("resources:{dimension}:availability")).await {
        Ok(Some(bytes)) => std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.6),
        _ => 0.6,
    }
}

fn subscription_factor(tier: SubscriptionTier) -> f64 {
    match tier {
        SubscriptionTier::Free => 0.25,
        SubscriptionTier::Standard => 0.5,
        SubscriptionTier::Premium => 1.0,
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct HistoryCounts {
    low: u64,
    medium: u64,
    high: u64,
}

async fn history_factor(store: &Arc<dyn KvStore>, task_type: &str) -> f64 {
    let key = format!("history:{task_type}:quality");
    let fields = store.hgetall(&key).await.unwrap_or_default();
    let mut counts = HistoryCounts::default();
    for (field, value) in fields {
        let n: u64 = std::str::from_utf8(&value).ok().and_then(|s| s.parse().ok()).unwrap_or(0);
        match field.as_str() {
            "low" => counts.low = n,
            "medium" => counts.medium = n,
            "high" => counts.high = n,
            _ => {}
        }
    }
    let total = counts.low + counts.medium + counts.high;
    if total == 0 {
        return 0.5;
    }
    let weighted = counts.low as f64 * 0.25 + counts.medium as f64 * 0.5 + counts.high as f64 * 0.75;
    weighted / total as f64
}

fn preference_factor(preference: Option<QualityPreference>) -> f64 {
    match preference {
        Some(QualityPreference::Quality) => 0.8,
        Some(QualityPreference::Speed) => 0.2,
        Some(QualityPreference::Balanced) | None => 0.5,
    }
}

fn tier_for_score(score: f64) -> QualityTier {
    if score >= 0.7 {
        QualityTier::High
    } else if score >= 0.4 {
        QualityTier::Medium
    } else {
        QualityTier::Low
    }
}

impl QualityAssessor {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    pub async fn assess(&self, request: QualityRequest<'_>) -> QualityAssessment {
        if let Some(target) = request.quality_target {
            if target.is_allowed_for(request.subscription_tier) {
                let mut factors = BTreeMap::new();
                factors.insert("requested".to_string(), 1.0);
                return QualityAssessment { tier: target, factors };
            }
            let mut factors = BTreeMap::new();
            factors.insert("subscription".to_string(), 1.0);
            return QualityAssessment {
                tier: QualityTier::highest_allowed(request.subscription_tier),
                factors,
            };
        }

        let input = input_factor(request.task_type, request.parameters);
        let resources = resource_factor(&self.store).await;
        let subscription = subscription_factor(request.subscription_tier);
        let history = history_factor(&self.store, request.task_type).await;
        let preference = preference_factor(request.quality_preference);

        let weighted = input * 0.25 + resources * 0.3 + subscription * 0.3 + history * 0.1 + preference * 0.05;
        let weight_total = 0.25 + 0.3 + 0.3 + 0.1 + 0.05;
        let score = weighted / weight_total;

        let mut factors = BTreeMap::new();
        factors.insert("input".to_string(), input);
        factors.insert("resources".to_string(), resources);
        factors.insert("subscription".to_string(), subscription);
        factors.insert("history".to_string(), history);
        factors.insert("preference".to_string(), preference);

        QualityAssessment {
            tier: tier_for_score(score),
            factors,
        }
    }

    /// Update `history:<type>:quality` with a fresh 30-day TTL on the key.
    pub async fn record_selection(&self, task_type: &str, tier: QualityTier) -> anyhow::Result<()> {
        let key = format!("history:{task_type}:quality");
        let field = tier.as_str();
        let current = self
            .store
            .hget(&key, field)
            .await?
            .and_then(|b| std::str::from_utf8(&b).ok().and_then(|s| s.parse::<u64>().ok()))
            .unwrap_or(0);
        self.store.hset(&key, field, (current + 1).to_string().into_bytes()).await?;
        // Hashes have no per-field TTL; a sibling marker key carries the
        // 30-day expiry so the cleanup loop can age out stale history.
        self.store.set(&format!("{key}:ttl-marker"), b"1".to_vec(), Some(HISTORY_TTL)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap as Map;
    use store::fake::InMemoryStore;

    fn store() -> Arc<dyn KvStore> {
        Arc::new(InMemoryStore::new())
    }

    #[tokio::test]
    async fn explicit_target_within_tier_is_honoured() {
        let assessor = QualityAssessor::new(store());
        let params: Parameters = Map::new();
        let assessment = assessor
            .assess(QualityRequest {
                task_type: "room-layout",
                parameters: &params,
                subscription_tier: SubscriptionTier::Premium,
                quality_preference: None,
                quality_target: Some(QualityTier::High),
            })
            .await;
        assert_eq!(assessment.tier, QualityTier::High);
        assert_eq!(assessment.factors.get("requested"), Some(&1.0));
    }

    #[tokio::test]
    async fn explicit_target_above_subscription_clamps_down() {
        let assessor = QualityAssessor::new(store());
        let params: Parameters = Map::new();
        let assessment = assessor
            .assess(QualityRequest {
                task_type: "room-layout",
                parameters: &params,
                subscription_tier: SubscriptionTier::Free,
                quality_preference: None,
                quality_target: Some(QualityTier::High),
            })
            .await;
        assert_eq!(assessment.tier, QualityTier::Low);
        assert_eq!(assessment.factors.get("subscription"), Some(&1.0));
    }

    #[tokio::test]
    async fn premium_quality_preference_skews_toward_high() {
        let assessor = QualityAssessor::new(store());
        let mut params: Parameters = Map::new();
        params.insert("room-type".to_string(), ParamValue::String("kitchen".into()));
        params.insert("room-size".to_string(), ParamValue::Number(90.0));
        let assessment = assessor
            .assess(QualityRequest {
                task_type: "room-layout",
                parameters: &params,
                subscription_tier: SubscriptionTier::Premium,
                quality_preference: Some(QualityPreference::Quality),
                quality_target: None,
            })
            .await;
        assert_eq!(assessment.tier, QualityTier::High);
    }

    #[tokio::test]
    async fn recording_a_selection_increments_history_counts() {
        let s = store();
        let assessor = QualityAssessor::new(s.clone());
        assessor.record_selection("room-layout", QualityTier::High).await.unwrap();
        assessor.record_selection("room-layout", QualityTier::High).await.unwrap();
        let value = s.hget("history:room-layout:quality", "high").await.unwrap().unwrap();
        assert_eq!(std::str::from_utf8(&value).unwrap(), "2");
    }
}
