//! Request authorization: API-key resolution, validation, and the per-key
//! sliding-window limit, plus the rate headers carried on every authorized
//! response.
//!
//! Shaped as a handler-called function rather than a `FromRequestParts`
//! extractor: the decision has to carry `limit`/`remaining` back out so the
//! handler can stamp them onto whichever response body it builds.

use crate::error::GatewayError;
use crate::server::router::GatewayState;
use axum::http::{HeaderMap, HeaderValue};
use axum_extra::headers::{Authorization, HeaderMapExt, authorization::Bearer};
use subtle::ConstantTimeEq;

#[derive(Debug, Clone)]
pub struct Authorized {
    pub api_key: String,
    /// The admin-wide key bypasses the per-key limiter entirely.
    pub admin: bool,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
}

impl Authorized {
    /// Attaches `X-RateLimit-Limit` / `X-RateLimit-Remaining`.
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        if let Some(limit) = self.limit
            && let Ok(value) = HeaderValue::from_str(&limit.to_string())
        {
            headers.insert("X-RateLimit-Limit", value);
        }
        if let Some(remaining) = self.remaining
            && let Ok(value) = HeaderValue::from_str(&remaining.to_string())
        {
            headers.insert("X-RateLimit-Remaining", value);
        }
    }
}

/// `Authorization: Bearer …` wins; `x-api-key` is the Anthropic-style spelling.
fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers.typed_get::<Authorization<Bearer>>() {
        return Some(auth.token().to_string());
    }
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

pub async fn authorize(
    state: &GatewayState,
    headers: &HeaderMap,
) -> Result<Authorized, GatewayError> {
    let Some(key) = extract_key(headers) else {
        return Err(GatewayError::Unauthorized("missing API key"));
    };

    if let Some(admin_key) = state.config.security.api_key.as_deref()
        && !admin_key.is_empty()
        && bool::from(key.as_bytes().ct_eq(admin_key.as_bytes()))
    {
        return Ok(Authorized {
            api_key: key,
            admin: true,
            limit: None,
            remaining: None,
        });
    }

    if !state.keys.validate(&key).await {
        return Err(GatewayError::Unauthorized("invalid API key"));
    }

    let decision = state.keys.check_rate_limit(&key).await;
    if !decision.allowed {
        return Err(GatewayError::RateLimited {
            limit: decision.limit.unwrap_or_default(),
            reset_in_seconds: decision.reset_in_seconds.unwrap_or_default(),
        });
    }

    Ok(Authorized {
        api_key: key,
        admin: false,
        limit: decision.limit,
        remaining: decision.remaining,
    })
}
