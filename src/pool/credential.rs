use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Early-refresh skew: tokens are refreshed five minutes before expiry so a
/// long upstream call never starts with a token about to die.
pub const EXPIRY_SKEW_MS: i64 = 300_000;

/// One OAuth2 grant in the pool.
///
/// `refresh_token` is the pool-wide identity: unique, never empty. A disabled
/// credential stays on disk and is excluded from rotation until explicitly
/// re-enabled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in_seconds: i64,
    pub issued_at_ms: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Credential {
    /// A freshly imported grant with no access token yet; the first rotation
    /// pass will refresh it.
    pub fn from_refresh_token(refresh_token: impl Into<String>) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: refresh_token.into(),
            expires_in_seconds: 0,
            issued_at_ms: 0,
            enabled: true,
            email: None,
            display_name: None,
        }
    }

    pub fn refresh_deadline_ms(&self) -> i64 {
        self.issued_at_ms + self.expires_in_seconds * 1000 - EXPIRY_SKEW_MS
    }

    /// True when the access token is missing or inside the skew window.
    pub fn needs_refresh(&self, now_ms: i64) -> bool {
        self.access_token.is_empty() || now_ms >= self.refresh_deadline_ms()
    }

    /// Applies a token-endpoint response: new access token, new clock.
    pub fn apply_refresh(&mut self, access_token: String, expires_in_seconds: i64) {
        self.access_token = access_token;
        self.expires_in_seconds = expires_in_seconds;
        self.issued_at_ms = Utc::now().timestamp_millis();
    }
}
