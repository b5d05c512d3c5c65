use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::HeatmapCell;

pub const WEAK_TOPIC_BELOW: f64 = 70.0;
pub const CONSISTENCY_STREAK_BELOW: u32 = 3;
pub const CHALLENGE_ACCURACY_FROM: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    pub fn for_accuracy(accuracy: f64) -> Self {
        if accuracy < 50.0 {
            Priority::High
        } else if accuracy < 65.0 {
            Priority::Medium
        } else {
            Priority::Low
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    WeakTopic,
    Consistency,
    Challenge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub kind: RecommendationKind,
    pub priority: Priority,
    pub subject: Option<String>,
    pub topic: Option<String>,
    pub accuracy: Option<f64>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FocusArea {
    pub subject: String,
    pub topic: String,
    pub accuracy: f64,
    pub priority: Priority,
}

fn by_accuracy_then_name(a: &HeatmapCell, b: &HeatmapCell) -> Ordering {
    a.accuracy
        .total_cmp(&b.accuracy)
        .then_with(|| a.subject.cmp(&b.subject))
        .then_with(|| a.topic.cmp(&b.topic))
}

fn is_weak(cell: &HeatmapCell) -> bool {
    cell.accuracy < WEAK_TOPIC_BELOW
}

/// Every weak topic, weakest first.
pub fn focus_areas(cells: &[HeatmapCell]) -> Vec<FocusArea> {
    let mut weak: Vec<&HeatmapCell> = cells.iter().filter(|c| is_weak(c)).collect();
    weak.sort_by(|a, b| by_accuracy_then_name(a, b));
    weak.into_iter()
        .map(|cell| FocusArea {
            subject: cell.subject.clone(),
            topic: cell.topic.clone(),
            accuracy: cell.accuracy,
            priority: Priority::for_accuracy(cell.accuracy),
        })
        .collect()
}

fn subject_label(subject: &str) -> String {
    subject
        .split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// One recommendation per subject (its weakest topic below 70%), then the standing nudges.
pub fn synthesize(cells: &[HeatmapCell], streak_days: u32, overall_accuracy: f64) -> Vec<Recommendation> {
    let mut weakest: BTreeMap<&str, &HeatmapCell> = BTreeMap::new();
    for cell in cells.iter().filter(|c| is_weak(c)) {
        weakest
            .entry(cell.subject.as_str())
            .and_modify(|current| {
                if by_accuracy_then_name(cell, *current) == Ordering::Less {
                    *current = cell;
                }
            })
            .or_insert(cell);
    }

    let mut picks: Vec<&HeatmapCell> = weakest.into_values().collect();
    picks.sort_by(|a, b| by_accuracy_then_name(a, b));

    let mut recommendations: Vec<Recommendation> = picks
        .into_iter()
        .map(|cell| Recommendation {
            kind: RecommendationKind::WeakTopic,
            priority: Priority::for_accuracy(cell.accuracy),
            subject: Some(cell.subject.clone()),
            topic: Some(cell.topic.clone()),
            accuracy: Some(cell.accuracy),
            message: format!(
                "Practise {} in {}: currently {:.0}% accurate",
                cell.topic,
                subject_label(&cell.subject),
                cell.accuracy
            ),
        })
        .collect();

    if streak_days < CONSISTENCY_STREAK_BELOW {
        recommendations.push(Recommendation {
            kind: RecommendationKind::Consistency,
            priority: Priority::Medium,
            subject: None,
            topic: None,
            accuracy: None,
            message: "Build a routine: aim for short practice sessions on at least 3 days in a row"
                .to_string(),
        });
    }

    if overall_accuracy >= CHALLENGE_ACCURACY_FROM {
        recommendations.push(Recommendation {
            kind: RecommendationKind::Challenge,
            priority: Priority::Low,
            subject: None,
            topic: None,
            accuracy: Some(overall_accuracy),
            message: "Strong accuracy overall: try harder questions to stretch further".to_string(),
        });
    }

    recommendations
}
