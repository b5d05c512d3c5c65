use std::{env, fmt::Display, str::FromStr};

use anyhow::{anyhow, Context};
use tracing::info;

pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub session_ttl_hours: i64,
    pub impersonation_ttl_minutes: i64,
    pub cors_origin: Option<String>,
    pub llm: Option<LlmConfig>,
}

#[derive(Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
}

impl std::fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            session_ttl_hours: 24,
            impersonation_ttl_minutes: 60,
            cors_origin: None,
            llm: None,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let llm = match optional("ANTHROPIC_API_KEY") {
            Some(api_key) => Some(LlmConfig {
                api_key,
                model: try_load("ANTHROPIC_MODEL", DEFAULT_MODEL)?,
                base_url: try_load("ANTHROPIC_BASE_URL", "https://api.anthropic.com")?,
                max_tokens: try_load("ANTHROPIC_MAX_TOKENS", "1500")?,
            }),
            None => {
                info!("ANTHROPIC_API_KEY not set, explanation generation disabled");
                None
            }
        };

        Ok(Self {
            port: try_load("PORT", "8080")?,
            session_ttl_hours: try_load_positive("SESSION_TTL_HOURS", "24")?,
            impersonation_ttl_minutes: try_load_positive("IMPERSONATION_TTL_MINUTES", "60")?,
            cors_origin: optional("CORS_ORIGIN"),
            llm,
        })
    }
}

pub fn database_url() -> anyhow::Result<String> {
    env::var("DATABASE_URL").context("DATABASE_URL must be set to a Postgres instance")
}

fn optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn try_load<T: FromStr>(key: &str, default: &str) -> anyhow::Result<T>
where
    T::Err: Display,
{
    let raw = optional(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });
    raw.trim()
        .parse()
        .map_err(|e| anyhow!("invalid {key} value {raw:?}: {e}"))
}

fn try_load_positive(key: &str, default: &str) -> anyhow::Result<i64> {
    let value: i64 = try_load(key, default)?;
    if value <= 0 {
        return Err(anyhow!("{key} must be positive, got {value}"));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_when_unset() {
        let port: u16 = try_load("ELEVENPLUS_TEST_UNSET_PORT", "8080").unwrap();
        assert_eq!(port, 8080);
    }

    #[test]
    fn malformed_defaults_are_errors() {
        let result: anyhow::Result<u16> = try_load("ELEVENPLUS_TEST_UNSET_PORT", "eighty");
        assert!(result.is_err());
    }

    #[test]
    fn durations_must_be_positive() {
        assert_eq!(try_load_positive("ELEVENPLUS_TEST_UNSET_TTL", "60").unwrap(), 60);
        for bad in ["0", "-15"] {
            let err = try_load_positive("ELEVENPLUS_TEST_UNSET_TTL", bad).unwrap_err();
            assert!(err.to_string().contains("must be positive"));
        }
    }

    #[test]
    fn llm_key_is_redacted_in_debug() {
        let llm = LlmConfig {
            api_key: "sk-secret".into(),
            model: DEFAULT_MODEL.into(),
            base_url: "https://api.anthropic.com".into(),
            max_tokens: 100,
        };
        assert!(!format!("{llm:?}").contains("sk-secret"));
    }
}
