//! Data types for the three autoscaling-plane loops (§4.7): scaling
//! dependencies between services, per-service load patterns and the
//! predictions they produce, and the scaling events the observer records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One edge of the dependency graph: how `target_service`'s minimum replica
/// count should track `source_service`'s current replica count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DependencyKind {
    /// `target = ceil(source.currentReplicas * ratio)`.
    Proportional { ratio: f64 },
    /// `target = replicas`, unconditionally.
    Fixed { replicas: i32 },
    /// `target = max(target.currentReplicas, target.minReplicas)`.
    Minimum,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDependency {
    pub source_service: String,
    pub target_service: String,
    pub kind: DependencyKind,
    pub enabled: bool,
}

impl ScalingDependency {
    pub fn key(source_service: &str, target_service: &str) -> String {
        format!("scaling-dependency:{source_service}:{target_service}")
    }
}

/// One entry of a service's expected-load calendar. A `None` field is a
/// wildcard: it matches any value of that field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LoadWindow {
    /// 0 = Sunday .. 6 = Saturday, matching `chrono::Weekday::num_days_from_sunday`.
    pub day_of_week: Option<u8>,
    pub hour_of_day: Option<u8>,
    pub minute_of_hour: Option<u8>,
    pub expected_load: f64,
}

impl LoadWindow {
    pub fn matches(&self, day_of_week: u8, hour_of_day: u8, minute_of_hour: u8) -> bool {
        self.day_of_week.map_or(true, |d| d == day_of_week)
            && self.hour_of_day.map_or(true, |h| h == hour_of_day)
            && self.minute_of_hour.map_or(true, |m| m == minute_of_hour)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceLoadPattern {
    pub service: String,
    pub windows: Vec<LoadWindow>,
    pub min_replicas: i32,
    pub max_replicas: i32,
}

impl ServiceLoadPattern {
    pub fn key(service: &str) -> String {
        format!("predictive-scaling:pattern:{service}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingPrediction {
    pub service: String,
    pub predicted_replicas: i32,
    pub confidence: f64,
    /// The service's actual replica count read at the moment this prediction
    /// was made; later predictions' confidence is scored against this.
    pub current_replicas_at_prediction: i32,
    pub created_at: DateTime<Utc>,
    pub applied_at: Option<DateTime<Utc>>,
}

impl ScalingPrediction {
    /// Not-yet-applied predictions awaiting the 5-minute apply tick.
    pub fn pending_key(service: &str) -> String {
        format!("predictive-scaling:prediction:{service}")
    }

    /// Bounded log of every prediction made for this service, used to score
    /// the confidence of the next one.
    pub fn history_key(service: &str) -> String {
        format!("predictive-scaling:history:{service}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScalingEventKind {
    Up,
    Down,
    LimitedScale,
    NoScale,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingEvent {
    pub service: String,
    pub kind: ScalingEventKind,
    pub current_replicas: i32,
    pub desired_replicas: i32,
    pub available_replicas: i32,
    pub metric_name: Option<String>,
    pub metric_value: Option<f64>,
    pub metric_threshold: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ScalingEvent {
    /// Debounce marker: `set_if_absent` with a 5-minute TTL gates at most one
    /// logged event per service per window.
    pub fn debounce_key(service: &str) -> String {
        format!("hpa-event:{service}")
    }

    pub fn service_list_key(service: &str) -> String {
        format!("hpa-events:{service}")
    }

    pub fn global_list_key() -> &'static str {
        "hpa-events:all"
    }

    pub fn effectiveness_key(service: &str) -> String {
        format!("hpa-event-effectiveness:{service}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_fields_match_anything() {
        let window = LoadWindow { day_of_week: Some(1), hour_of_day: None, minute_of_hour: None, expected_load: 0.9 };
        assert!(window.matches(1, 9, 0));
        assert!(window.matches(1, 23, 59));
        assert!(!window.matches(2, 9, 0));
    }
}
