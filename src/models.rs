use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tiers::{Badge, MasteryLevel, ReadinessTier, RiskLevel, StagnationLevel};

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => anyhow::bail!("unknown {} value: {other}", stringify!($name)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Parent,
    Admin,
    SuperAdmin,
}

string_enum!(Role {
    Parent => "parent",
    Admin => "admin",
    SuperAdmin => "super_admin",
});

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin | Role::SuperAdmin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionTier {
    Free,
    Ascent,
    Summit,
}

string_enum!(SubscriptionTier {
    Free => "free",
    Ascent => "ascent",
    Summit => "summit",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Cancelled,
}

string_enum!(SubscriptionStatus {
    Active => "active",
    Trialing => "trialing",
    PastDue => "past_due",
    Cancelled => "cancelled",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExamType {
    Gl,
    Cem,
    Iseb,
    Independent,
}

string_enum!(ExamType {
    Gl => "gl",
    Cem => "cem",
    Iseb => "iseb",
    Independent => "independent",
});

/// Billing state mirrored into the profile record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub tier: SubscriptionTier,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub billing_customer_id: Option<String>,
    pub billing_subscription_id: Option<String>,
}

impl Subscription {
    pub fn free() -> Self {
        Self {
            tier: SubscriptionTier::Free,
            status: SubscriptionStatus::Active,
            current_period_end: None,
            billing_customer_id: None,
            billing_subscription_id: None,
        }
    }

    pub fn is_current(&self) -> bool {
        matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing
        )
    }
}

#[derive(Debug, Clone)]
pub struct AuthUser {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
}

#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub user_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub role: Role,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Child {
    pub id: Uuid,
    pub parent_id: Uuid,
    pub name: String,
    pub year_group: i16,
    pub exam_type: ExamType,
    pub avatar: Option<String>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ImpersonationGrant {
    pub admin_id: Uuid,
    pub target_user_id: Uuid,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Explanations {
    pub step_by_step: String,
    pub visual_illustration: String,
    pub worked_example: String,
}

#[derive(Debug, Clone)]
pub struct Question {
    pub id: Uuid,
    pub subject: String,
    pub topic: String,
    pub difficulty: i16,
    pub question_text: String,
    pub options: Vec<String>,
    pub correct_answer: String,
    pub explanation: Option<String>,
    pub cached_explanations: Option<Explanations>,
}

/// One answered question. Only ever consumed in aggregate.
#[derive(Debug, Clone)]
pub struct PracticeAttempt {
    pub session_id: Uuid,
    pub subject: String,
    pub topic: String,
    pub is_correct: bool,
    pub response_time_ms: i32,
    pub difficulty: i16,
    pub answered_at: DateTime<Utc>,
}

/// Per-child, per-subject totals for cohort benchmarking. No identities leave the store.
#[derive(Debug, Clone)]
pub struct CohortRow {
    pub child_id: Uuid,
    pub subject: String,
    pub correct: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Up,
    Down,
    #[default]
    Stable,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubjectAccuracy {
    pub subject: String,
    pub attempts: u32,
    pub correct: u32,
    pub accuracy: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComprehensiveSummary {
    pub total_attempts: u32,
    pub correct_attempts: u32,
    pub accuracy: f64,
    pub average_response_seconds: f64,
    pub active_days: u32,
    pub streak_days: u32,
    pub questions_per_day: f64,
    pub last_practiced: Option<DateTime<Utc>>,
    pub subjects: Vec<SubjectAccuracy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeatmapCell {
    pub subject: String,
    pub topic: String,
    pub attempts: u32,
    pub correct: u32,
    pub accuracy: f64,
    pub mastery_level: MasteryLevel,
    pub mastery_badge: Badge,
    pub needs_focus: bool,
    pub trend: TrendDirection,
    pub last_practiced: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Heatmap {
    pub cells: Vec<HeatmapCell>,
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoreComponent {
    pub score: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadinessComponents {
    pub accuracy: ScoreComponent,
    pub coverage: ScoreComponent,
    pub consistency: ScoreComponent,
    pub difficulty: ScoreComponent,
    pub improvement: ScoreComponent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessTrend {
    pub direction: TrendDirection,
    pub delta: i32,
    pub previous_score: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReadinessScoreData {
    pub has_data: bool,
    pub overall_score: u32,
    pub tier: ReadinessTier,
    pub tier_badge: Badge,
    pub components: ReadinessComponents,
    pub confidence: Confidence,
    pub trend: Option<ReadinessTrend>,
    pub attempts_counted: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectPercentile {
    pub subject: String,
    pub percentile: u32,
    pub cohort_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum BenchmarkData {
    #[serde(rename_all = "camelCase")]
    Available {
        overall_percentile: u32,
        cohort_size: u32,
        subjects: Vec<SubjectPercentile>,
    },
    #[serde(rename_all = "camelCase")]
    Locked { required_tier: SubscriptionTier },
    #[serde(rename_all = "camelCase")]
    InsufficientData { cohort_size: u32, minimum: u32 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RushFactor {
    pub percentage: f64,
    pub threshold_seconds: u32,
    pub level: RiskLevel,
    pub badge: Badge,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FatigueDropOff {
    pub drop_points: f64,
    pub sessions_measured: u32,
    pub level: RiskLevel,
    pub badge: Badge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagnantTopic {
    pub subject: String,
    pub topic: String,
    pub previous_accuracy: f64,
    pub recent_accuracy: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StagnantTopics {
    pub count: u32,
    pub level: StagnationLevel,
    pub badge: Badge,
    pub topics: Vec<StagnantTopic>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LearningHealth {
    pub rush_factor: RushFactor,
    pub fatigue: FatigueDropOff,
    pub stagnant_topics: StagnantTopics,
    pub overall: RiskLevel,
    pub overall_badge: Badge,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardData {
    pub comprehensive: Option<ComprehensiveSummary>,
    pub readiness: Option<ReadinessScoreData>,
    pub heatmap: Option<Heatmap>,
    pub benchmark: Option<BenchmarkData>,
    pub learning_health: Option<LearningHealth>,
}

/// Row shape for attempt CSV imports.
#[derive(Debug, Clone, Deserialize)]
pub struct AttemptCsvRow {
    pub child_id: Uuid,
    pub question_id: Uuid,
    pub session_id: Uuid,
    pub subject: String,
    pub topic: String,
    pub is_correct: bool,
    pub response_time_ms: i32,
    pub difficulty: i16,
    pub answered_at: DateTime<Utc>,
    pub source_key: Option<String>,
}
