//! Rotating, self-refreshing, self-disabling OAuth2 credential pool.
//!
//! Reads serve from an in-memory snapshot; every mutation happens under the
//! pool mutex and is persisted to `accounts.json` before the call returns.
//! Refresh I/O runs *outside* the mutex against a snapshot of the target
//! credential, then a compare-update re-acquires the mutex to commit, so a
//! slow identity provider never blocks rotation for other requests.

mod credential;
mod oauth;

pub use credential::{Credential, EXPIRY_SKEW_MS};
pub use oauth::{TokenEndpoint, TokenResponse};

use crate::error::{GatewayError, IsRetryable, OauthError};
use crate::store::JsonFile;
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// How long an in-memory enabled view may serve before re-reading the file.
const RELOAD_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageCounter {
    pub requests: u64,
    pub last_used_ms: i64,
}

/// Per-credential counters plus the pool-wide total.
#[derive(Debug, Serialize)]
pub struct UsageSnapshot {
    pub total_requests: u64,
    pub credentials: Vec<CredentialUsage>,
}

#[derive(Debug, Serialize)]
pub struct CredentialUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub enabled: bool,
    pub requests: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct PoolInner {
    all: Vec<Credential>,
    /// Indices into `all` for enabled credentials, in file order.
    enabled: Vec<usize>,
    /// Always within `[0, enabled.len())` while `enabled` is non-empty.
    cursor: usize,
    usage: HashMap<String, UsageCounter>,
    last_reload: Option<Instant>,
}

impl PoolInner {
    fn rebuild_enabled(&mut self) {
        self.enabled = self
            .all
            .iter()
            .enumerate()
            .filter(|(_, cred)| cred.enabled)
            .map(|(idx, _)| idx)
            .collect();
        if self.enabled.is_empty() {
            self.cursor = 0;
        } else {
            self.cursor %= self.enabled.len();
        }
    }

    fn current(&self) -> Option<&Credential> {
        self.enabled.get(self.cursor).map(|&idx| &self.all[idx])
    }

    fn advance_cursor(&mut self) {
        if !self.enabled.is_empty() {
            self.cursor = (self.cursor + 1) % self.enabled.len();
        }
    }

    fn record_usage(&mut self, refresh_token: &str) {
        let counter = self.usage.entry(refresh_token.to_string()).or_default();
        counter.requests += 1;
        counter.last_used_ms = Utc::now().timestamp_millis();
    }

    fn position_by_token(&self, refresh_token: &str) -> Option<usize> {
        self.all
            .iter()
            .position(|cred| cred.refresh_token == refresh_token)
    }
}

enum Pick {
    Ready(Credential),
    NeedsRefresh(Credential),
    Empty,
}

pub struct CredentialPool {
    file: JsonFile<Vec<Credential>>,
    endpoint: TokenEndpoint,
    refresh_policy: ExponentialBuilder,
    inner: Mutex<PoolInner>,
}

impl CredentialPool {
    /// Loads the pool from its backing file.
    pub async fn load(
        file: JsonFile<Vec<Credential>>,
        endpoint: TokenEndpoint,
    ) -> Result<Self, GatewayError> {
        let all = file.load().await?;
        let mut inner = PoolInner {
            all,
            ..PoolInner::default()
        };
        inner.rebuild_enabled();
        inner.last_reload = Some(Instant::now());
        info!(
            total = inner.all.len(),
            enabled = inner.enabled.len(),
            "credential pool loaded"
        );

        let refresh_policy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(300))
            .with_max_times(2)
            .with_jitter();

        Ok(Self {
            file,
            endpoint,
            refresh_policy,
            inner: Mutex::new(inner),
        })
    }

    /// Returns a credential with a valid access token, rotating the cursor
    /// and incrementing the usage counter exactly once.
    pub async fn get_token(&self) -> Result<Credential, GatewayError> {
        self.maybe_reload().await?;

        let attempts = self.inner.lock().await.enabled.len();
        for _ in 0..attempts {
            let pick = {
                let mut inner = self.inner.lock().await;
                match inner.current().cloned() {
                    None => Pick::Empty,
                    Some(cred) if !cred.needs_refresh(Utc::now().timestamp_millis()) => {
                        inner.advance_cursor();
                        inner.record_usage(&cred.refresh_token);
                        Pick::Ready(cred)
                    }
                    Some(cred) => Pick::NeedsRefresh(cred),
                }
            };

            let stale = match pick {
                Pick::Empty => break,
                Pick::Ready(cred) => return Ok(cred),
                Pick::NeedsRefresh(cred) => cred,
            };

            // Refresh I/O happens outside the mutex.
            match self.refresh_with_retry(&stale).await {
                Ok(token) => {
                    let (refreshed, persisted) = {
                        let mut inner = self.inner.lock().await;
                        let Some(pos) = inner.position_by_token(&stale.refresh_token) else {
                            // Deleted while we were refreshing; rotation moves on.
                            continue;
                        };
                        inner.all[pos].apply_refresh(token.access_token, token.expires_in);
                        let refreshed = inner.all[pos].clone();
                        inner.advance_cursor();
                        inner.record_usage(&refreshed.refresh_token);
                        (refreshed, inner.all.clone())
                    };
                    self.file.store(&persisted).await?;
                    return Ok(refreshed);
                }
                Err(e) if e.is_forbidden() => {
                    warn!(
                        email = stale.email.as_deref().unwrap_or("<unknown>"),
                        "identity provider returned 403; disabling credential"
                    );
                    self.disable_by_token(&stale.refresh_token).await?;
                }
                Err(e) => {
                    warn!("credential refresh failed, rotating past it: {e}");
                    self.inner.lock().await.advance_cursor();
                }
            }
        }

        Err(GatewayError::NoCredentials)
    }

    /// Upstream rejected a request with 403 while using this credential:
    /// disable it permanently and hand back the next viable token.
    pub async fn on_upstream_forbidden(
        &self,
        refresh_token: &str,
    ) -> Result<Credential, GatewayError> {
        warn!("upstream returned 403; disabling the credential in use");
        self.disable_by_token(refresh_token).await?;
        self.get_token().await
    }

    /// Admin: append one credential. The refresh token must be new.
    pub async fn add(&self, cred: Credential) -> Result<(), GatewayError> {
        if cred.refresh_token.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "credential refresh_token must be non-empty".to_string(),
            ));
        }
        let persisted = {
            let mut inner = self.inner.lock().await;
            if inner.position_by_token(&cred.refresh_token).is_some() {
                return Err(GatewayError::InvalidRequest(
                    "credential with this refresh_token already exists".to_string(),
                ));
            }
            inner.all.push(cred);
            inner.rebuild_enabled();
            inner.all.clone()
        };
        self.file.store(&persisted).await
    }

    /// Admin: append many credentials, skipping duplicates. Returns how many
    /// were actually inserted.
    pub async fn bulk_add(&self, creds: Vec<Credential>) -> Result<usize, GatewayError> {
        let (inserted, persisted) = {
            let mut inner = self.inner.lock().await;
            let mut inserted = 0usize;
            for cred in creds {
                if cred.refresh_token.trim().is_empty()
                    || inner.position_by_token(&cred.refresh_token).is_some()
                {
                    continue;
                }
                inner.all.push(cred);
                inserted += 1;
            }
            inner.rebuild_enabled();
            (inserted, inner.all.clone())
        };
        if inserted > 0 {
            self.file.store(&persisted).await?;
        }
        Ok(inserted)
    }

    /// Admin: delete by position in the full (not enabled) sequence.
    pub async fn delete(&self, index: usize) -> Result<(), GatewayError> {
        let persisted = {
            let mut inner = self.inner.lock().await;
            if index >= inner.all.len() {
                return Err(GatewayError::InvalidRequest(format!(
                    "credential index {index} out of range"
                )));
            }
            let removed = inner.all.remove(index);
            inner.usage.remove(&removed.refresh_token);
            inner.rebuild_enabled();
            inner.all.clone()
        };
        self.file.store(&persisted).await
    }

    /// Admin: flip the enabled flag by position in the full sequence.
    pub async fn toggle(&self, index: usize, enabled: bool) -> Result<(), GatewayError> {
        let persisted = {
            let mut inner = self.inner.lock().await;
            if index >= inner.all.len() {
                return Err(GatewayError::InvalidRequest(format!(
                    "credential index {index} out of range"
                )));
            }
            inner.all[index].enabled = enabled;
            inner.rebuild_enabled();
            inner.all.clone()
        };
        self.file.store(&persisted).await
    }

    /// Exchange an authorization code and upsert the resulting credential.
    pub async fn import_authorization_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<Credential, GatewayError> {
        let token = self.endpoint.exchange_code(code, redirect_uri).await?;
        let Some(refresh_token) = token.refresh_token.clone().filter(|t| !t.is_empty()) else {
            return Err(GatewayError::InvalidRequest(
                "code exchange yielded no refresh_token".to_string(),
            ));
        };

        let (cred, persisted) = {
            let mut inner = self.inner.lock().await;
            let pos = match inner.position_by_token(&refresh_token) {
                Some(pos) => pos,
                None => {
                    inner.all.push(Credential::from_refresh_token(&refresh_token));
                    inner.all.len() - 1
                }
            };
            inner.all[pos].apply_refresh(token.access_token.clone(), token.expires_in);
            inner.rebuild_enabled();
            (inner.all[pos].clone(), inner.all.clone())
        };
        self.file.store(&persisted).await?;
        Ok(cred)
    }

    pub async fn usage_snapshot(&self) -> UsageSnapshot {
        let inner = self.inner.lock().await;
        let credentials = inner
            .all
            .iter()
            .map(|cred| {
                let counter = inner.usage.get(&cred.refresh_token);
                CredentialUsage {
                    email: cred.email.clone(),
                    enabled: cred.enabled,
                    requests: counter.map(|c| c.requests).unwrap_or_default(),
                    last_used_ms: counter.map(|c| c.last_used_ms),
                }
            })
            .collect::<Vec<_>>();
        UsageSnapshot {
            total_requests: credentials.iter().map(|c| c.requests).sum(),
            credentials,
        }
    }

    async fn disable_by_token(&self, refresh_token: &str) -> Result<(), GatewayError> {
        let persisted = {
            let mut inner = self.inner.lock().await;
            let Some(pos) = inner.position_by_token(refresh_token) else {
                return Ok(());
            };
            inner.all[pos].enabled = false;
            inner.rebuild_enabled();
            inner.all.clone()
        };
        self.file.store(&persisted).await
    }

    async fn refresh_with_retry(&self, cred: &Credential) -> Result<TokenResponse, OauthError> {
        let refresh_token = cred.refresh_token.clone();
        let endpoint = self.endpoint.clone();
        (move || {
            let endpoint = endpoint.clone();
            let refresh_token = refresh_token.clone();
            async move { endpoint.refresh(&refresh_token).await }
        })
        .retry(&self.refresh_policy)
        .when(|e: &OauthError| e.is_retryable())
        .notify(|err, dur: Duration| {
            warn!("token refresh retrying after error {err}, sleeping {dur:?}");
        })
        .await
    }

    /// Double-checked reload of the enabled view from disk.
    async fn maybe_reload(&self) -> Result<(), GatewayError> {
        let is_stale = |last: Option<Instant>| last.is_none_or(|t| t.elapsed() > RELOAD_INTERVAL);
        if !is_stale(self.inner.lock().await.last_reload) {
            return Ok(());
        }

        let from_disk = self.file.load().await?;
        let mut inner = self.inner.lock().await;
        if is_stale(inner.last_reload) {
            inner.all = from_disk;
            inner.rebuild_enabled();
            inner.last_reload = Some(Instant::now());
        }
        Ok(())
    }
}
