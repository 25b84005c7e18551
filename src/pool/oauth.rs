//! The two identity-provider interactions the pool performs: refreshing an
//! access token and exchanging an authorization code. Both are plain form
//! POSTs; the raw HTTP status is preserved in [`OauthError`] because the
//! pool's failure model hinges on distinguishing 403 from everything else.

use crate::error::OauthError;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Bounded timeout for identity-provider calls.
const TOKEN_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(10);
const BODY_SNIPPET_MAX: usize = 200;

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    client: reqwest::Client,
    token_url: Url,
    client_id: String,
    client_secret: String,
}

impl TokenEndpoint {
    pub fn new(token_url: Url, client_id: String, client_secret: String) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(TOKEN_ENDPOINT_TIMEOUT)
            .build()
            .expect("failed to build identity-provider HTTP client");
        Self {
            client,
            token_url,
            client_id,
            client_secret,
        }
    }

    /// `grant_type=refresh_token` exchange.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse, OauthError> {
        self.request_token(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
        ])
        .await
    }

    /// `grant_type=authorization_code` exchange, used on credential import.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OauthError> {
        self.request_token(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    async fn request_token(&self, form: &[(&str, &str)]) -> Result<TokenResponse, OauthError> {
        let response = self
            .client
            .post(self.token_url.clone())
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(OauthError::Status {
                status,
                body: snippet(&body),
            });
        }

        serde_json::from_str(&body).map_err(|e| OauthError::Parse {
            message: e.to_string(),
            body: snippet(&body),
        })
    }
}

fn snippet(body: &str) -> String {
    match body.char_indices().nth(BODY_SNIPPET_MAX) {
        Some((idx, _)) => format!("{}...<truncated>", &body[..idx]),
        None => body.to_string(),
    }
}
