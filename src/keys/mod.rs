//! Locally-issued API keys: validation, per-key sliding-window rate limits,
//! and write-behind persistence.
//!
//! Hot-path mutations (`validate`, `check_rate_limit`) touch memory only; a
//! background task flushes the whole key set to `api_keys.json` every minute,
//! and admin mutations (create, delete, policy update) persist synchronously.

pub mod limiter;

pub use limiter::{RateDecision, check as check_limit};

use crate::error::GatewayError;
use crate::store::JsonFile;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitPolicy {
    pub enabled: bool,
    pub max_requests: u32,
    pub window_ms: u64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            max_requests: 60,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub requests: u64,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    /// 10-second usage bins, keyed by bucket start in epoch milliseconds.
    #[serde(default)]
    pub usage_buckets: BTreeMap<i64, u32>,
}

impl ApiKey {
    pub fn generate(name: Option<String>) -> Self {
        let mut bytes = [0u8; 24];
        rand::rng().fill_bytes(&mut bytes);
        Self {
            key: format!("ck-{}", URL_SAFE_NO_PAD.encode(bytes)),
            name: name.unwrap_or_default(),
            created_at: Utc::now(),
            last_used_at: None,
            requests: 0,
            rate_limit: RateLimitPolicy::default(),
            usage_buckets: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct KeyStats {
    pub total_keys: usize,
    pub total_requests: u64,
    pub rate_limited_keys: usize,
}

pub struct KeyStore {
    file: JsonFile<Vec<ApiKey>>,
    inner: Mutex<HashMap<String, ApiKey>>,
}

impl KeyStore {
    pub async fn load(file: JsonFile<Vec<ApiKey>>) -> Result<Self, GatewayError> {
        let keys = file.load().await?;
        let inner = keys
            .into_iter()
            .map(|record| (record.key.clone(), record))
            .collect();
        Ok(Self {
            file,
            inner: Mutex::new(inner),
        })
    }

    /// Creates a key. A caller-supplied key value must not collide.
    pub async fn create(
        &self,
        name: Option<String>,
        rate_limit: Option<RateLimitPolicy>,
        supplied_key: Option<String>,
    ) -> Result<ApiKey, GatewayError> {
        let (record, persisted) = {
            let mut inner = self.inner.lock().await;
            let mut record = ApiKey::generate(name);
            if let Some(supplied) = supplied_key {
                if inner.contains_key(&supplied) {
                    return Err(GatewayError::InvalidRequest(
                        "an API key with this value already exists".to_string(),
                    ));
                }
                record.key = supplied;
            }
            if let Some(policy) = rate_limit {
                record.rate_limit = policy;
            }
            inner.insert(record.key.clone(), record.clone());
            (record, snapshot(&inner))
        };
        self.file.store(&persisted).await?;
        Ok(record)
    }

    /// Known key? Updates `last_used_at` and the request counter in memory.
    pub async fn validate(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(key) {
            Some(record) => {
                record.last_used_at = Some(Utc::now());
                record.requests += 1;
                true
            }
            None => false,
        }
    }

    pub async fn check_rate_limit(&self, key: &str) -> RateDecision {
        self.check_rate_limit_at(key, Utc::now().timestamp_millis())
            .await
    }

    /// Clock-injectable variant used by tests.
    pub async fn check_rate_limit_at(&self, key: &str, now_ms: i64) -> RateDecision {
        let mut inner = self.inner.lock().await;
        match inner.get_mut(key) {
            Some(record) => limiter::check(record, now_ms),
            None => RateDecision {
                allowed: false,
                limit: None,
                remaining: None,
                reset_in_seconds: None,
                reason: Some("unknown API key".to_string()),
            },
        }
    }

    pub async fn update_rate_limit(
        &self,
        key: &str,
        policy: RateLimitPolicy,
    ) -> Result<(), GatewayError> {
        let persisted = {
            let mut inner = self.inner.lock().await;
            let record = inner.get_mut(key).ok_or_else(|| {
                GatewayError::InvalidRequest("unknown API key".to_string())
            })?;
            record.rate_limit = policy;
            snapshot(&inner)
        };
        self.file.store(&persisted).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), GatewayError> {
        let persisted = {
            let mut inner = self.inner.lock().await;
            if inner.remove(key).is_none() {
                return Err(GatewayError::InvalidRequest("unknown API key".to_string()));
            }
            snapshot(&inner)
        };
        self.file.store(&persisted).await
    }

    pub async fn stats(&self) -> KeyStats {
        let inner = self.inner.lock().await;
        KeyStats {
            total_keys: inner.len(),
            total_requests: inner.values().map(|record| record.requests).sum(),
            rate_limited_keys: inner
                .values()
                .filter(|record| record.rate_limit.enabled)
                .count(),
        }
    }

    /// Writes the full in-memory key set to disk.
    pub async fn flush(&self) -> Result<(), GatewayError> {
        let persisted = {
            let inner = self.inner.lock().await;
            snapshot(&inner)
        };
        self.file.store(&persisted).await
    }

    pub fn spawn_flush_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = store.flush().await {
                    warn!("api key flush failed: {e}");
                }
            }
        })
    }
}

fn snapshot(inner: &HashMap<String, ApiKey>) -> Vec<ApiKey> {
    let mut keys: Vec<ApiKey> = inner.values().cloned().collect();
    keys.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    keys
}
