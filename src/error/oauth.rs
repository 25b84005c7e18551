use super::IsRetryable;
use axum::http::StatusCode;
use thiserror::Error as ThisError;

/// Failures of the identity-provider token endpoint.
///
/// The HTTP status is kept verbatim so the credential pool can treat 403 as
/// permanent (credential disabled) and everything else as transient (skip
/// this rotation, try again on the next one).
#[derive(Debug, ThisError)]
pub enum OauthError {
    #[error("token endpoint returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("token endpoint request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token endpoint response parse error: {message}. Body: {body}")]
    Parse { message: String, body: String },
}

impl OauthError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            OauthError::Status { status, .. } => Some(*status),
            OauthError::Request(e) => e.status(),
            OauthError::Parse { .. } => None,
        }
    }

    /// True exactly for the identity provider's "this grant is dead" answer.
    pub fn is_forbidden(&self) -> bool {
        self.status() == Some(StatusCode::FORBIDDEN)
    }
}

impl IsRetryable for OauthError {
    fn is_retryable(&self) -> bool {
        match self {
            OauthError::Request(_) => true,
            OauthError::Status { status, .. } => {
                *status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
            }
            OauthError::Parse { .. } => false,
        }
    }
}
