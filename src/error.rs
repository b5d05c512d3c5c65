use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldIssue {
    pub field: String,
    pub message: String,
}

impl FieldIssue {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("You do not have access to this resource")]
    Forbidden,

    #[error("Invalid request")]
    Validation(Vec<FieldIssue>),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0} is not available")]
    Unavailable(&'static str),

    #[error("Internal server error")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::Validation(vec![FieldIssue::new(field, message)])
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::Validation(issues) => {
                json!({"success": false, "error": self.to_string(), "issues": issues})
            }
            AppError::Internal(source) => {
                error!(error = ?source, "request failed");
                json!({"success": false, "error": self.to_string()})
            }
            _ => json!({"success": false, "error": self.to_string()}),
        };

        (status, Json(body)).into_response()
    }
}

/// Parse a JSON body into a typed request, reporting serde's complaint as a field issue.
pub fn parse_body<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, AppError> {
    if bytes.is_empty() {
        return Err(AppError::invalid("body", "request body is required"));
    }
    serde_json::from_slice(bytes).map_err(|e| {
        let message = e.to_string();
        let field = message
            .split('`')
            .nth(1)
            .filter(|_| message.contains("field"))
            .unwrap_or("body")
            .to_string();
        AppError::Validation(vec![FieldIssue::new(field, message)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields, rename_all = "camelCase")]
    struct Payload {
        #[allow(dead_code)]
        question_id: String,
    }

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(AppError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::invalid("x", "bad").status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::NotFound("Question").status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Internal(anyhow::anyhow!("db down")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = AppError::Internal(anyhow::anyhow!("password=hunter2"));
        assert_eq!(err.to_string(), "Internal server error");
    }

    #[test]
    fn unknown_fields_are_reported_by_name() {
        let err = parse_body::<Payload>(br#"{"questionId":"q","extra":1}"#).unwrap_err();
        match err {
            AppError::Validation(issues) => assert_eq!(issues[0].field, "extra"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_fields_are_reported_by_name() {
        let err = parse_body::<Payload>(b"{}").unwrap_err();
        match err {
            AppError::Validation(issues) => assert_eq!(issues[0].field, "questionId"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(parse_body::<Payload>(b""), Err(AppError::Validation(_))));
    }
}
