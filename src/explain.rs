use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    auth,
    config::{LlmConfig, ANTHROPIC_VERSION},
    error::{parse_body, AppError},
    models::{Explanations, Question},
    state::AppState,
};

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u32,
}

/// Text generation backend, mockable in tests.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<Completion>;
}

pub struct AnthropicClient {
    client: Client,
    config: LlmConfig,
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<MessageParam<'a>>,
}

#[derive(Serialize)]
struct MessageParam<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicClient {
    pub fn new(config: LlmConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl LlmClient for AnthropicClient {
    async fn complete(&self, prompt: &str) -> anyhow::Result<Completion> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));
        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: self.config.max_tokens,
            messages: vec![MessageParam {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .context("LLM request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("LLM returned {status}: {body}");
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .context("LLM response was not valid JSON")?;
        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("");

        Ok(Completion {
            text,
            tokens_used: parsed.usage.input_tokens + parsed.usage.output_tokens,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn from_level(level: i16) -> Self {
        match level {
            i16::MIN..=1 => Difficulty::Easy,
            2 => Difficulty::Medium,
            _ => Difficulty::Hard,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Difficulty::Easy => "easy",
            Difficulty::Medium => "medium",
            Difficulty::Hard => "hard",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GenerateRequest {
    pub question_id: Uuid,
    pub question_text: Option<String>,
    pub correct_answer: Option<String>,
    pub topic: Option<String>,
    pub difficulty: Option<Difficulty>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    pub success: bool,
    pub explanations: Explanations,
    pub tokens_used: u32,
    pub cached: bool,
}

/// Everything the prompt needs, from the stored question or the request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplanationInput {
    pub question_text: String,
    pub correct_answer: String,
    pub subject: Option<String>,
    pub topic: String,
    pub difficulty: Difficulty,
    pub options: Vec<String>,
    /// The short explanation stored with the question, if any.
    pub reference: Option<String>,
}

impl ExplanationInput {
    pub fn resolve(request: &GenerateRequest, question: Option<&Question>) -> Option<Self> {
        let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        match question {
            Some(q) => Some(Self {
                question_text: q.question_text.clone(),
                correct_answer: q.correct_answer.clone(),
                subject: Some(q.subject.replace('_', " ")),
                topic: q.topic.clone(),
                difficulty: Difficulty::from_level(q.difficulty),
                options: q.options.clone(),
                reference: non_empty(&q.explanation),
            }),
            None => Some(Self {
                question_text: non_empty(&request.question_text)?,
                correct_answer: non_empty(&request.correct_answer)?,
                subject: None,
                topic: non_empty(&request.topic).unwrap_or_else(|| "general".to_string()),
                difficulty: request.difficulty.unwrap_or(Difficulty::Medium),
                options: Vec::new(),
                reference: None,
            }),
        }
    }
}

pub fn build_prompt(input: &ExplanationInput) -> String {
    let mut prompt = String::from("You are an encouraging 11+ tutor writing for a 10 year old.\n");
    if let Some(subject) = &input.subject {
        prompt.push_str(&format!("Subject: {subject}\n"));
    }
    prompt.push_str(&format!(
        "Topic: {}\nDifficulty: {}\nQuestion: {}\n",
        input.topic,
        input.difficulty.as_str(),
        input.question_text
    ));
    if !input.options.is_empty() {
        prompt.push_str(&format!("Options: {}\n", input.options.join(" | ")));
    }
    prompt.push_str(&format!("Correct answer: {}\n", input.correct_answer));
    if let Some(reference) = &input.reference {
        prompt.push_str(&format!("Stay consistent with this existing note: {reference}\n"));
    }
    prompt.push('\n');
    prompt.push_str(
        "Reply with only a JSON object with three string fields:\n\
         \"stepByStep\": a numbered walkthrough reaching the correct answer,\n\
         \"visualIllustration\": a description of a diagram or picture that makes the idea clear,\n\
         \"workedExample\": a similar question solved in full.",
    );
    prompt
}

#[derive(Deserialize)]
struct RawExplanations {
    #[serde(alias = "step_by_step")]
    #[serde(rename = "stepByStep")]
    step_by_step: String,
    #[serde(alias = "visual_illustration")]
    #[serde(rename = "visualIllustration")]
    visual_illustration: String,
    #[serde(alias = "worked_example")]
    #[serde(rename = "workedExample")]
    worked_example: String,
}

/// Pulls the JSON object out of a model reply, tolerating code fences and chatter around it.
pub fn parse_explanations(text: &str) -> anyhow::Result<Explanations> {
    let start = text.find('{').context("no JSON object in model reply")?;
    let end = text.rfind('}').context("unterminated JSON object in model reply")?;
    if end < start {
        bail!("malformed JSON object in model reply");
    }
    let raw: RawExplanations =
        serde_json::from_str(&text[start..=end]).context("model reply did not match the expected shape")?;

    let explanations = Explanations {
        step_by_step: raw.step_by_step.trim().to_string(),
        visual_illustration: raw.visual_illustration.trim().to_string(),
        worked_example: raw.worked_example.trim().to_string(),
    };
    if explanations.step_by_step.is_empty()
        || explanations.visual_illustration.is_empty()
        || explanations.worked_example.is_empty()
    {
        bail!("model reply left an explanation empty");
    }
    Ok(explanations)
}

pub async fn generate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<GenerateResponse>, AppError> {
    let ctx = auth::authenticate(state.store.as_ref(), &headers, Utc::now()).await?;
    let request: GenerateRequest = parse_body(&body)?;

    let question = state.store.find_question(request.question_id).await?;
    if let Some(cached) = question.as_ref().and_then(|q| q.cached_explanations.clone()) {
        debug!(question = %request.question_id, "serving cached explanations");
        return Ok(Json(GenerateResponse {
            success: true,
            explanations: cached,
            tokens_used: 0,
            cached: true,
        }));
    }

    let input = ExplanationInput::resolve(&request, question.as_ref())
        .ok_or(AppError::NotFound("Question"))?;
    let llm = state
        .llm
        .clone()
        .ok_or(AppError::Unavailable("Explanation generation"))?;

    let completion = llm.complete(&build_prompt(&input)).await?;
    let explanations = parse_explanations(&completion.text)?;
    info!(
        question = %request.question_id,
        user = %ctx.actor.id,
        tokens = completion.tokens_used,
        "generated explanations"
    );

    if let Some(question) = &question {
        let store = state.store.clone();
        let question_id = question.id;
        let to_cache = explanations.clone();
        tokio::spawn(async move {
            if let Err(e) = store.cache_explanations(question_id, &to_cache).await {
                warn!(question = %question_id, error = ?e, "failed to cache explanations");
            }
        });
    }

    Ok(Json(GenerateResponse {
        success: true,
        explanations,
        tokens_used: completion.tokens_used,
        cached: false,
    }))
}

pub async fn cached_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<serde_json::Value>, AppError> {
    auth::authenticate(state.store.as_ref(), &headers, Utc::now()).await?;
    let question_id = params
        .get("questionId")
        .ok_or_else(|| AppError::invalid("questionId", "questionId is required"))?
        .parse::<Uuid>()
        .map_err(|_| AppError::invalid("questionId", "questionId must be a UUID"))?;

    let explanations = state
        .store
        .find_question(question_id)
        .await?
        .and_then(|q| q.cached_explanations)
        .ok_or(AppError::NotFound("Explanations"))?;

    Ok(Json(json!({"success": true, "explanations": explanations, "cached": true})))
}
