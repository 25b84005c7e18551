//! Per-API-key upstream identity: a project id and a session id with
//! independent lifetimes. Backed by two TTL caches so each field expires and
//! regenerates on its own and cold keys age out without bookkeeping.

use moka::sync::Cache;
use rand::Rng as _;
use std::time::Duration;

pub const PROJECT_TTL: Duration = Duration::from_secs(12 * 60 * 60);
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

const CACHE_CAPACITY: u64 = 10_000;
const SUFFIX_LEN: usize = 5;
const BASE36: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Word lists for project ids: `<adjective>-<noun>-<base36 suffix>`.
const ADJECTIVES: [&str; 5] = ["brisk", "calm", "eager", "vivid", "quiet"];
const NOUNS: [&str; 5] = ["otter", "maple", "comet", "harbor", "willow"];

pub struct IdentityCache {
    projects: Cache<String, String>,
    sessions: Cache<String, String>,
}

impl Default for IdentityCache {
    fn default() -> Self {
        Self::with_ttls(PROJECT_TTL, SESSION_TTL)
    }
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// TTLs are injectable for tests; production uses 12 h / 1 h.
    pub fn with_ttls(project_ttl: Duration, session_ttl: Duration) -> Self {
        Self {
            projects: Cache::builder()
                .time_to_live(project_ttl)
                .max_capacity(CACHE_CAPACITY)
                .build(),
            sessions: Cache::builder()
                .time_to_live(session_ttl)
                .max_capacity(CACHE_CAPACITY)
                .build(),
        }
    }

    /// The identity pair for an API key, regenerating whichever field has
    /// expired. A session renewal never touches the project id and vice
    /// versa.
    pub fn get(&self, api_key: &str) -> (String, String) {
        let project_id = self
            .projects
            .get_with(api_key.to_string(), generate_project_id);
        let session_id = self
            .sessions
            .get_with(api_key.to_string(), generate_session_id);
        (project_id, session_id)
    }
}

/// `<adjective>-<noun>-<5 base36 chars>`, e.g. `brisk-otter-a1b2c`.
fn generate_project_id() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES[rng.random_range(0..ADJECTIVES.len())];
    let noun = NOUNS[rng.random_range(0..NOUNS.len())];
    let suffix: String = (0..SUFFIX_LEN)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect();
    format!("{adjective}-{noun}-{suffix}")
}

/// The upstream protocol wants the decimal text of a negative 64-bit value.
fn generate_session_id() -> String {
    let value = rand::rng().random_range(1..=i64::MAX);
    format!("-{value}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_project_shape(project_id: &str) {
        let segments: Vec<&str> = project_id.split('-').collect();
        assert_eq!(segments.len(), 3, "unexpected shape: {project_id}");
        assert!(segments[0].chars().all(|c| c.is_ascii_lowercase()));
        assert!(segments[1].chars().all(|c| c.is_ascii_lowercase()));
        assert_eq!(segments[2].len(), SUFFIX_LEN);
        assert!(
            segments[2]
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        );
    }

    #[test]
    fn project_id_matches_expected_shape() {
        for _ in 0..50 {
            assert_project_shape(&generate_project_id());
        }
    }

    #[test]
    fn session_id_is_negative_decimal() {
        for _ in 0..50 {
            let session_id = generate_session_id();
            let value: i64 = session_id.parse().unwrap();
            assert!(value < 0);
        }
    }

    #[test]
    fn identity_is_stable_within_ttl() {
        let cache = IdentityCache::new();
        let first = cache.get("key-1");
        let second = cache.get("key-1");
        assert_eq!(first, second);
        assert_ne!(cache.get("key-2"), first);
    }

    #[test]
    fn session_expiry_does_not_rotate_project() {
        let cache = IdentityCache::with_ttls(
            Duration::from_secs(3600),
            Duration::from_millis(1),
        );
        let (project_before, session_before) = cache.get("key");
        std::thread::sleep(Duration::from_millis(20));
        let (project_after, session_after) = cache.get("key");
        assert_eq!(project_before, project_after);
        assert_ne!(session_before, session_after);
    }
}
