//! A bounded, TTL-backed key-to-deadline map.
//!
//! Replaces the pattern of a process-global `static` cache: every consumer
//! constructs and owns its own instance, so lifetime and scope are explicit.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

pub struct TtlGuard<K> {
    entries: RwLock<HashMap<K, Instant>>,
    ttl: Duration,
    enabled: bool,
}

impl<K: Eq + Hash + Clone> TtlGuard<K> {
    pub fn new(ttl: Duration, enabled: bool) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            enabled,
        }
    }

    /// Returns `true` if `key` was already guarded (and still within its TTL),
    /// otherwise records it and returns `false`. Always returns `false` when
    /// the guard is disabled.
    pub async fn check_and_set(&self, key: K) -> bool {
        if !self.enabled {
            return false;
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        entries.retain(|_, deadline| *deadline > now);
        if entries.contains_key(&key) {
            return true;
        }
        entries.insert(key, now + self.ttl);
        false
    }

    pub async fn clear(&self, key: &K) {
        self.entries.write().await.remove(key);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn suppresses_duplicate_within_ttl() {
        let guard = TtlGuard::new(Duration::from_secs(60), true);
        assert!(!guard.check_and_set("a").await);
        assert!(guard.check_and_set("a").await);
    }

    #[tokio::test]
    async fn disabled_guard_never_suppresses() {
        let guard = TtlGuard::new(Duration::from_secs(60), false);
        assert!(!guard.check_and_set("a").await);
        assert!(!guard.check_and_set("a").await);
    }

    #[tokio::test]
    async fn clear_releases_the_key() {
        let guard = TtlGuard::new(Duration::from_secs(60), true);
        assert!(!guard.check_and_set("a").await);
        guard.clear(&"a").await;
        assert!(!guard.check_and_set("a").await);
    }
}
