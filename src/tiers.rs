//! Fixed threshold tables that turn raw percentages and counts into labelled tiers.
//!
//! Each metric keeps its own cut points; they are intentionally not unified.
//! Lower bounds are inclusive unless noted, and every table carries an explicit
//! `NoData` variant so an empty measurement never renders as a real bucket.

use serde::{Deserialize, Serialize};

fn measured(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MasteryLevel {
    #[default]
    NoData,
    NeedsPractice,
    Developing,
    Proficient,
    Mastered,
}

impl MasteryLevel {
    pub fn from_accuracy(accuracy: Option<f64>) -> Self {
        match measured(accuracy) {
            None => MasteryLevel::NoData,
            Some(a) if a >= 85.0 => MasteryLevel::Mastered,
            Some(a) if a >= 75.0 => MasteryLevel::Proficient,
            Some(a) if a >= 65.0 => MasteryLevel::Developing,
            Some(_) => MasteryLevel::NeedsPractice,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            MasteryLevel::NoData => "No data",
            MasteryLevel::NeedsPractice => "Needs practice",
            MasteryLevel::Developing => "Developing",
            MasteryLevel::Proficient => "Proficient",
            MasteryLevel::Mastered => "Mastered",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            MasteryLevel::NoData => "gray",
            MasteryLevel::NeedsPractice => "red",
            MasteryLevel::Developing => "amber",
            MasteryLevel::Proficient => "blue",
            MasteryLevel::Mastered => "green",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessTier {
    #[default]
    NoData,
    NeedsFocus,
    Developing,
    Good,
    Excellent,
}

impl ReadinessTier {
    pub fn from_score(score: Option<f64>) -> Self {
        match measured(score) {
            None => ReadinessTier::NoData,
            Some(s) if s >= 85.0 => ReadinessTier::Excellent,
            Some(s) if s >= 70.0 => ReadinessTier::Good,
            Some(s) if s >= 55.0 => ReadinessTier::Developing,
            Some(_) => ReadinessTier::NeedsFocus,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReadinessTier::NoData => "Not enough practice yet",
            ReadinessTier::NeedsFocus => "Needs focus",
            ReadinessTier::Developing => "Developing",
            ReadinessTier::Good => "Good",
            ReadinessTier::Excellent => "Excellent",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            ReadinessTier::NoData => "gray",
            ReadinessTier::NeedsFocus => "red",
            ReadinessTier::Developing => "amber",
            ReadinessTier::Good => "blue",
            ReadinessTier::Excellent => "green",
        }
    }
}

/// Question content quality ("Ascent score") tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustTier {
    #[default]
    NoData,
    Unverified,
    Ember,
    Ascent,
    Summit,
}

impl TrustTier {
    pub fn from_score(score: Option<f64>) -> Self {
        match measured(score) {
            None => TrustTier::NoData,
            Some(s) if s >= 90.0 => TrustTier::Summit,
            Some(s) if s >= 75.0 => TrustTier::Ascent,
            Some(s) if s >= 50.0 => TrustTier::Ember,
            Some(_) => TrustTier::Unverified,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            TrustTier::NoData => "Not yet scored",
            TrustTier::Unverified => "Unverified",
            TrustTier::Ember => "Ember",
            TrustTier::Ascent => "Ascent",
            TrustTier::Summit => "Summit verified",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            TrustTier::NoData => "gray",
            TrustTier::Unverified => "red",
            TrustTier::Ember => "orange",
            TrustTier::Ascent => "blue",
            TrustTier::Summit => "purple",
        }
    }
}

/// Severity of a learning-health risk indicator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    #[default]
    NoData,
    Healthy,
    Monitor,
    ActionNeeded,
}

impl RiskLevel {
    /// Rush factor: share of answers given under the rush threshold, as a percentage.
    pub fn for_rush_factor(percentage: Option<f64>) -> Self {
        match measured(percentage) {
            None => RiskLevel::NoData,
            Some(p) if p < 10.0 => RiskLevel::Healthy,
            Some(p) if p <= 20.0 => RiskLevel::Monitor,
            Some(_) => RiskLevel::ActionNeeded,
        }
    }

    /// Fatigue drop-off: accuracy points lost between session halves.
    pub fn for_fatigue(drop_points: Option<f64>) -> Self {
        match measured(drop_points) {
            None => RiskLevel::NoData,
            Some(d) if d <= 5.0 => RiskLevel::Healthy,
            Some(d) if d <= 15.0 => RiskLevel::Monitor,
            Some(_) => RiskLevel::ActionNeeded,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RiskLevel::NoData => "No data",
            RiskLevel::Healthy => "Healthy",
            RiskLevel::Monitor => "Monitor",
            RiskLevel::ActionNeeded => "Action needed",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            RiskLevel::NoData => "gray",
            RiskLevel::Healthy => "green",
            RiskLevel::Monitor => "amber",
            RiskLevel::ActionNeeded => "red",
        }
    }

    /// Most severe measured level; `NoData` only when nothing was measured.
    pub fn worst(levels: impl IntoIterator<Item = RiskLevel>) -> Self {
        levels.into_iter().max().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagnationLevel {
    #[default]
    NoData,
    Healthy,
    Warning,
    HighPriority,
    Critical,
}

impl StagnationLevel {
    /// `count` is `None` when there was no practice to judge stagnation from.
    pub fn from_count(count: Option<u32>) -> Self {
        match count {
            None => StagnationLevel::NoData,
            Some(0) => StagnationLevel::Healthy,
            Some(1..=2) => StagnationLevel::Warning,
            Some(3..=5) => StagnationLevel::HighPriority,
            Some(_) => StagnationLevel::Critical,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StagnationLevel::NoData => "No data",
            StagnationLevel::Healthy => "Healthy",
            StagnationLevel::Warning => "Warning",
            StagnationLevel::HighPriority => "High priority",
            StagnationLevel::Critical => "Critical",
        }
    }

    pub fn color(&self) -> &'static str {
        match self {
            StagnationLevel::NoData => "gray",
            StagnationLevel::Healthy => "green",
            StagnationLevel::Warning => "amber",
            StagnationLevel::HighPriority => "orange",
            StagnationLevel::Critical => "red",
        }
    }

    pub fn as_risk(&self) -> RiskLevel {
        match self {
            StagnationLevel::NoData => RiskLevel::NoData,
            StagnationLevel::Healthy => RiskLevel::Healthy,
            StagnationLevel::Warning => RiskLevel::Monitor,
            StagnationLevel::HighPriority | StagnationLevel::Critical => RiskLevel::ActionNeeded,
        }
    }
}

/// What a client renders for a tier: its display label and badge colour.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Badge {
    pub label: String,
    pub color: String,
}

macro_rules! badge {
    ($($tier:ty),+) => {$(
        impl $tier {
            pub fn badge(&self) -> Badge {
                Badge {
                    label: self.label().to_string(),
                    color: self.color().to_string(),
                }
            }
        }
    )+};
}

badge!(MasteryLevel, ReadinessTier, TrustTier, RiskLevel, StagnationLevel);
