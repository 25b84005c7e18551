use super::IsRetryable;
use super::oauth::OauthError;
use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error as ThisError;

/// Top-level error for everything a request can hit inside the gateway.
#[derive(Debug, ThisError)]
pub enum GatewayError {
    #[error("no enabled credential could produce a valid token")]
    NoCredentials,

    #[error("credential rejected by upstream; it has been disabled")]
    CredentialForbidden,

    #[error("upstream error with status {status}: {body}")]
    UpstreamStatus { status: StatusCode, body: String },

    #[error("upstream stream interrupted: {0}")]
    UpstreamInterrupted(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),

    #[error("rate limit exceeded")]
    RateLimited {
        limit: u32,
        reset_in_seconds: u64,
    },

    #[error("tool schema rejected: {0}")]
    ToolSchemaInvalid(String),

    #[error("tool arguments are not valid JSON: {0}")]
    ToolArgsParse(String),

    #[error(transparent)]
    Oauth(#[from] OauthError),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("persistent store error: {0}")]
    Store(String),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> axum::response::Response {
        let (status, body) = match &self {
            GatewayError::NoCredentials => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorObject::new("no_credentials_available", self.to_string()),
            ),
            GatewayError::CredentialForbidden => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorObject::new("account_disabled", self.to_string()),
            ),
            GatewayError::UpstreamStatus { status, body } => (
                *status,
                ApiErrorObject::new("upstream_error", format!("upstream {status}: {body}")),
            ),
            GatewayError::UpstreamInterrupted(_) => (
                StatusCode::BAD_GATEWAY,
                ApiErrorObject::new("upstream_interrupted", self.to_string()),
            ),
            GatewayError::InvalidRequest(_) => (
                StatusCode::BAD_REQUEST,
                ApiErrorObject::new("invalid_request_error", self.to_string()),
            ),
            GatewayError::Unauthorized(reason) => (
                StatusCode::UNAUTHORIZED,
                ApiErrorObject::new("unauthorized", (*reason).to_string()),
            ),
            GatewayError::RateLimited {
                limit,
                reset_in_seconds,
            } => {
                let mut object = ApiErrorObject::new(
                    "rate_limit_exceeded",
                    format!("rate limit of {limit} requests exceeded"),
                );
                object.reset_in_seconds = Some(*reset_in_seconds);
                (StatusCode::TOO_MANY_REQUESTS, object)
            }
            GatewayError::ToolSchemaInvalid(_) | GatewayError::ToolArgsParse(_) => (
                StatusCode::BAD_REQUEST,
                ApiErrorObject::new("invalid_request_error", self.to_string()),
            ),
            GatewayError::Oauth(_) => (
                StatusCode::BAD_GATEWAY,
                ApiErrorObject::new("upstream_error", "identity provider error".to_string()),
            ),
            GatewayError::Reqwest(_) => (
                StatusCode::BAD_GATEWAY,
                ApiErrorObject::new("upstream_error", "upstream request failed".to_string()),
            ),
            GatewayError::Json(_) => (
                StatusCode::BAD_REQUEST,
                ApiErrorObject::new("invalid_request_error", self.to_string()),
            ),
            GatewayError::Io(_) | GatewayError::Store(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorObject::new("internal_error", "an internal error occurred".to_string()),
            ),
            GatewayError::Url(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiErrorObject::new("internal_error", "invalid configured URL".to_string()),
            ),
        };

        let mut response = (status, Json(ApiErrorBody { inner: body })).into_response();
        if let GatewayError::RateLimited {
            reset_in_seconds, ..
        } = &self
        {
            if let Ok(value) = reset_in_seconds.to_string().parse() {
                response.headers_mut().insert("X-RateLimit-Reset", value);
            }
        }
        response
    }
}

impl IsRetryable for GatewayError {
    fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Reqwest(_) => true,
            GatewayError::Oauth(oauth) => oauth.is_retryable(),
            GatewayError::UpstreamStatus { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            _ => false,
        }
    }
}

/// Standardized API error payload: `{"error": {...}}`.
#[derive(Debug, Serialize)]
pub struct ApiErrorObject {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_in_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl ApiErrorObject {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            reset_in_seconds: None,
            details: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    #[serde(rename = "error")]
    pub inner: ApiErrorObject,
}
