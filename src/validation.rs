use std::collections::HashSet;

use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    auth,
    error::{parse_body, AppError},
    state::AppState,
    tiers::{Badge, TrustTier},
};

pub const MAX_BATCH: usize = 50;
const MIN_TEXT_LEN: usize = 10;
const MAX_TEXT_LEN: usize = 2_000;
const MIN_OPTIONS: usize = 2;
const MAX_OPTIONS: usize = 6;
const ERROR_PENALTY: i32 = 25;
const WARNING_PENALTY: i32 = 10;

pub const KNOWN_SUBJECTS: [&str; 4] = [
    "mathematics",
    "english",
    "verbal_reasoning",
    "non_verbal_reasoning",
];

/// Question as submitted for review. Missing fields are reported as issues, not parse errors.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default, deny_unknown_fields)]
pub struct QuestionInput {
    pub id: Option<Uuid>,
    pub subject: String,
    pub topic: String,
    pub difficulty: i16,
    pub question_text: String,
    pub options: Vec<String>,
    pub correct_answer: String,
    pub explanation: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ValidateRequest {
    pub question: Option<QuestionInput>,
    pub questions: Option<Vec<QuestionInput>>,
    #[serde(default)]
    pub persist: bool,
}

impl ValidateRequest {
    fn into_batch(self) -> Result<(Vec<QuestionInput>, bool), AppError> {
        match (self.question, self.questions) {
            (Some(one), None) => Ok((vec![one], self.persist)),
            (None, Some(many)) if many.is_empty() => {
                Err(AppError::invalid("questions", "questions must not be empty"))
            }
            (None, Some(many)) if many.len() > MAX_BATCH => Err(AppError::invalid(
                "questions",
                format!("at most {MAX_BATCH} questions per request"),
            )),
            (None, Some(many)) => Ok((many, self.persist)),
            _ => Err(AppError::invalid(
                "question",
                "provide exactly one of question or questions",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub field: &'static str,
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub id: Option<Uuid>,
    pub valid: bool,
    pub score: u32,
    pub tier: TrustTier,
    pub tier_badge: Badge,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub success: bool,
    pub results: Vec<ValidationResult>,
    pub summary: ValidationSummary,
}

fn check(question: &QuestionInput) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();
    let mut push = |field, severity, message: String| {
        issues.push(ValidationIssue {
            field,
            severity,
            message,
        })
    };

    let text_len = question.question_text.trim().chars().count();
    if text_len < MIN_TEXT_LEN {
        push(
            "questionText",
            Severity::Error,
            format!("question text must be at least {MIN_TEXT_LEN} characters"),
        );
    } else if text_len > MAX_TEXT_LEN {
        push(
            "questionText",
            Severity::Error,
            format!("question text must be at most {MAX_TEXT_LEN} characters"),
        );
    }

    let options: Vec<&str> = question.options.iter().map(|o| o.trim()).collect();
    if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&options.len()) {
        push(
            "options",
            Severity::Error,
            format!("expected {MIN_OPTIONS} to {MAX_OPTIONS} options, got {}", options.len()),
        );
    }
    if options.iter().any(|o| o.is_empty()) {
        push("options", Severity::Error, "options must not be blank".to_string());
    }
    let distinct: HashSet<String> = options.iter().map(|o| o.to_lowercase()).collect();
    if distinct.len() != options.len() {
        push("options", Severity::Error, "options must be unique".to_string());
    }

    let answer = question.correct_answer.trim();
    if answer.is_empty() {
        push("correctAnswer", Severity::Error, "correct answer is required".to_string());
    } else if !options.contains(&answer) {
        push(
            "correctAnswer",
            Severity::Error,
            "correct answer must be one of the options".to_string(),
        );
    }

    if !KNOWN_SUBJECTS.contains(&question.subject.as_str()) {
        push(
            "subject",
            Severity::Error,
            format!("unknown subject {:?}", question.subject),
        );
    }
    if question.topic.trim().is_empty() {
        push("topic", Severity::Error, "topic is required".to_string());
    }
    if !(1..=3).contains(&question.difficulty) {
        push(
            "difficulty",
            Severity::Error,
            "difficulty must be 1 (easy), 2 (medium) or 3 (hard)".to_string(),
        );
    }
    if question
        .explanation
        .as_deref()
        .map_or(true, |e| e.trim().is_empty())
    {
        push(
            "explanation",
            Severity::Warning,
            "no explanation provided".to_string(),
        );
    }

    issues
}

pub fn trust_score(issues: &[ValidationIssue]) -> u32 {
    let penalty: i32 = issues
        .iter()
        .map(|issue| match issue.severity {
            Severity::Error => ERROR_PENALTY,
            Severity::Warning => WARNING_PENALTY,
        })
        .sum();
    (100 - penalty).clamp(0, 100) as u32
}

pub fn validate(question: &QuestionInput) -> ValidationResult {
    let issues = check(question);
    let score = trust_score(&issues);
    let tier = TrustTier::from_score(Some(f64::from(score)));
    ValidationResult {
        id: question.id,
        valid: !issues.iter().any(|i| i.severity == Severity::Error),
        score,
        tier,
        tier_badge: tier.badge(),
        issues,
    }
}

pub fn summarize(results: &[ValidationResult]) -> ValidationSummary {
    let passed = results.iter().filter(|r| r.valid).count();
    ValidationSummary {
        total: results.len(),
        passed,
        failed: results.len() - passed,
    }
}

pub async fn validate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<ValidateResponse>, AppError> {
    let ctx = auth::authenticate(state.store.as_ref(), &headers, Utc::now()).await?;
    ctx.require_admin()?;
    let (questions, persist) = parse_body::<ValidateRequest>(&body)?.into_batch()?;

    let results: Vec<ValidationResult> = questions.iter().map(validate).collect();
    let summary = summarize(&results);
    info!(
        admin = %ctx.actor.id,
        total = summary.total,
        failed = summary.failed,
        "validated questions"
    );

    if persist {
        let scores: Vec<(Uuid, i16)> = results
            .iter()
            .filter_map(|r| r.id.map(|id| (id, r.score as i16)))
            .collect();
        let store = state.store.clone();
        tokio::spawn(async move {
            for (id, score) in scores {
                if let Err(e) = store.update_trust_score(id, score).await {
                    warn!(question = %id, error = ?e, "failed to persist trust score");
                }
            }
        });
    }

    Ok(Json(ValidateResponse {
        success: true,
        results,
        summary,
    }))
}
