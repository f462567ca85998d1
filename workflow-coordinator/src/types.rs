use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A structurally-typed request parameter. Represents arbitrary JSON without
/// leaking a target-language container name across the API: callers build
/// `ParamValue::Map`/`ParamValue::List` rather than handing out a
/// `serde_json::Value` or a raw `HashMap`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<ParamValue>),
    Map(BTreeMap<String, ParamValue>),
}

impl ParamValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ParamValue]> {
        match self {
            ParamValue::List(items) => Some(items.as_slice()),
            _ => None,
        }
    }

    /// Convert to a `serde_json::Value`, used only at the orchestrator
    /// boundary where workflow arguments are JSON-serialised.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            ParamValue::Null => serde_json::Value::Null,
            ParamValue::Bool(b) => serde_json::Value::Bool(*b),
            ParamValue::Number(n) => serde_json::json!(n),
            ParamValue::String(s) => serde_json::Value::String(s.clone()),
            ParamValue::List(items) => serde_json::Value::Array(items.iter().map(ParamValue::to_json).collect()),
            ParamValue::Map(map) => {
                serde_json::Value::Object(map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect())
            }
        }
    }
}

pub type Parameters = BTreeMap<String, ParamValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    High,
    Medium,
    Low,
    Batch,
}

impl Priority {
    pub const ALL: [Priority; 4] = [Priority::High, Priority::Medium, Priority::Low, Priority::Batch];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "HIGH",
            Priority::Medium => "MEDIUM",
            Priority::Low => "LOW",
            Priority::Batch => "BATCH",
        }
    }

    pub fn queue_key(self) -> String {
        format!("queue:{}", self.as_str())
    }
}

impl From<config_manager::Priority> for Priority {
    fn from(p: config_manager::Priority) -> Self {
        match p {
            config_manager::Priority::High => Priority::High,
            config_manager::Priority::Medium => Priority::Medium,
            config_manager::Priority::Low => Priority::Low,
            config_manager::Priority::Batch => Priority::Batch,
        }
    }
}

impl From<Priority> for config_manager::Priority {
    fn from(p: Priority) -> Self {
        match p {
            Priority::High => config_manager::Priority::High,
            Priority::Medium => config_manager::Priority::Medium,
            Priority::Low => config_manager::Priority::Low,
            Priority::Batch => config_manager::Priority::Batch,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Standard,
    Premium,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    Low,
    Medium,
    High,
}

impl QualityTier {
    pub fn as_str(self) -> &'static str {
        match self {
            QualityTier::Low => "low",
            QualityTier::Medium => "medium",
            QualityTier::High => "high",
        }
    }

    /// Tiers a subscription is permitted to request, per §4.5.
    pub fn allowed_for(tier: SubscriptionTier) -> &'static [QualityTier] {
        match tier {
            SubscriptionTier::Free => &[QualityTier::Low],
            SubscriptionTier::Standard => &[QualityTier::Low, QualityTier::Medium],
            SubscriptionTier::Premium => &[QualityTier::Low, QualityTier::Medium, QualityTier::High],
        }
    }

    pub fn highest_allowed(tier: SubscriptionTier) -> QualityTier {
        *Self::allowed_for(tier).last().expect("non-empty")
    }

    pub fn is_allowed_for(self, tier: SubscriptionTier) -> bool {
        Self::allowed_for(tier).contains(&self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub priority: Priority,
    pub parameters: Parameters,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub user_id: Option<String>,
    pub subscription_tier: Option<SubscriptionTier>,
    pub workflow_id: Option<String>,
    pub deadline_ms: Option<i64>,
    pub quality_preference: Option<QualityPreference>,
    pub quality_target: Option<QualityTier>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_type: String,
        parameters: Parameters,
        priority: Priority,
        user_id: Option<String>,
        subscription_tier: Option<SubscriptionTier>,
        max_attempts: u32,
        quality_preference: Option<QualityPreference>,
        quality_target: Option<QualityTier>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_type,
            priority,
            parameters,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            user_id,
            subscription_tier,
            workflow_id: None,
            deadline_ms: None,
            quality_preference,
            quality_target,
        }
    }

    pub fn key(id: &str) -> String {
        format!("task:{id}")
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Per-task-type fault isolator state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerRecord {
    pub failure_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub open: bool,
}

impl Default for CircuitBreakerRecord {
    fn default() -> Self {
        Self {
            failure_count: 0,
            last_failure: None,
            open: false,
        }
    }
}

/// Quality assessment request, mirroring `submitTask`'s optional overrides.
#[derive(Debug, Clone)]
pub struct QualityRequest<'a> {
    pub task_type: &'a str,
    pub parameters: &'a Parameters,
    pub subscription_tier: SubscriptionTier,
    pub quality_preference: Option<QualityPreference>,
    pub quality_target: Option<QualityTier>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreference {
    Quality,
    Speed,
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub tier: QualityTier,
    pub factors: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceAllocation {
    pub cpu_millicores: u64,
    pub memory_bytes: u64,
    pub gpu_count: u32,
    pub node_selector: BTreeMap<String, String>,
}
