//! Sliding-window rate limiting over 10-second buckets.
//!
//! Pure bucket math on an [`ApiKey`] record; the store serializes calls per
//! key map, which makes the increment linearizable: two concurrent requests
//! under a cap of 1 can never both observe `allowed`.

use super::ApiKey;
use serde::Serialize;

/// Bucket granularity in milliseconds.
pub const BUCKET_MS: i64 = 10_000;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RateDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_in_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RateDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            limit: None,
            remaining: None,
            reset_in_seconds: None,
            reason: None,
        }
    }
}

pub fn bucket_of(now_ms: i64) -> i64 {
    now_ms / BUCKET_MS * BUCKET_MS
}

/// Applies the sliding-window check at `now_ms`, mutating the key's buckets.
pub fn check(key: &mut ApiKey, now_ms: i64) -> RateDecision {
    let policy = key.rate_limit.clone();
    if !policy.enabled {
        return RateDecision::unlimited();
    }

    let window_ms = policy.window_ms.max(BUCKET_MS as u64) as i64;
    let cap = policy.max_requests;
    let window_start = now_ms - window_ms;

    key.usage_buckets.retain(|bucket, _| *bucket > window_start);
    let count: u64 = key.usage_buckets.values().map(|c| u64::from(*c)).sum();

    if count >= u64::from(cap) {
        // Purge may leave the map empty when the window and the clock race;
        // an empty window cannot deny.
        let Some(oldest) = key.usage_buckets.keys().next().copied() else {
            return allow(key, now_ms, cap, count);
        };
        let reset_ms = (oldest + window_ms - now_ms).max(0);
        return RateDecision {
            allowed: false,
            limit: Some(cap),
            remaining: Some(0),
            reset_in_seconds: Some((reset_ms as u64).div_ceil(1000)),
            reason: Some(format!(
                "rate limit of {cap} requests per {}s exceeded",
                window_ms / 1000
            )),
        };
    }

    allow(key, now_ms, cap, count)
}

fn allow(key: &mut ApiKey, now_ms: i64, cap: u32, count: u64) -> RateDecision {
    *key.usage_buckets.entry(bucket_of(now_ms)).or_insert(0) += 1;
    RateDecision {
        allowed: true,
        limit: Some(cap),
        remaining: Some(cap.saturating_sub(count as u32 + 1)),
        reset_in_seconds: None,
        reason: None,
    }
}

#[cfg(test)]
mod tests {
    use super::super::RateLimitPolicy;
    use super::*;

    fn limited_key(cap: u32, window_ms: u64) -> ApiKey {
        let mut key = ApiKey::generate(Some("test".to_string()));
        key.rate_limit = RateLimitPolicy {
            enabled: true,
            max_requests: cap,
            window_ms,
        };
        key
    }

    #[test]
    fn burst_over_cap_denies_exactly_the_excess() {
        let mut key = limited_key(3, 60_000);
        let t0 = 1_700_000_000_000;
        let decisions: Vec<bool> = (0..7)
            .map(|i| check(&mut key, t0 + i * 100).allowed)
            .collect();
        assert_eq!(decisions, vec![true, true, true, false, false, false, false]);
    }

    #[test]
    fn deny_reports_reset_within_window() {
        let mut key = limited_key(2, 60_000);
        let t0 = 1_700_000_000_000;
        assert_eq!(check(&mut key, t0).remaining, Some(1));
        assert_eq!(check(&mut key, t0 + 1_000).remaining, Some(0));

        let denied = check(&mut key, t0 + 2_000);
        assert!(!denied.allowed);
        let reset = denied.reset_in_seconds.unwrap();
        assert!((58..=60).contains(&reset), "reset {reset} out of range");
    }

    #[test]
    fn window_expiry_readmits() {
        let mut key = limited_key(2, 60_000);
        let t0 = 1_700_000_000_000;
        check(&mut key, t0);
        check(&mut key, t0 + 1_000);
        assert!(!check(&mut key, t0 + 2_000).allowed);
        assert!(check(&mut key, t0 + 61_000).allowed);
    }

    #[test]
    fn disabled_policy_never_denies() {
        let mut key = ApiKey::generate(None);
        for i in 0..100 {
            let decision = check(&mut key, 1_700_000_000_000 + i);
            assert!(decision.allowed);
            assert_eq!(decision.limit, None);
        }
        assert!(key.usage_buckets.is_empty());
    }

    #[test]
    fn counts_aggregate_across_buckets() {
        let mut key = limited_key(3, 60_000);
        let t0 = 1_700_000_000_000;
        check(&mut key, t0);
        check(&mut key, t0 + 15_000);
        check(&mut key, t0 + 30_000);
        assert_eq!(key.usage_buckets.len(), 3);
        assert!(!check(&mut key, t0 + 45_000).allowed);
    }
}
