//! Dedupe guard.
//!
//! Three layers, in decreasing order of authority:
//! - the durable creation claim (`dedupe_claims`, TTL-bounded), taken inside
//!   `OutboxStore::create_queued`;
//! - the active-row constraint (partial unique index on `dedupe_key` over
//!   Queued/Sending rows);
//! - [`LocalSuppressor`], an in-memory key → expiry map used by the direct
//!   send path. It is lost on restart and never replaces the durable layers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use courier_common::config::DedupeConfig;
use courier_common::types::DedupeClaim;

/// Default lifetime of a local suppression entry (10 minutes).
pub const DEFAULT_LOCAL_TTL: Duration = Duration::from_secs(600);

/// Map size past which inserts sweep expired entries.
pub const DEFAULT_CLEANUP_THRESHOLD: usize = 1000;

/// Whether a stored claim still blocks creation at `now`.
pub fn claim_is_live(claim: &DedupeClaim, now: DateTime<Utc>) -> bool {
    claim.expires_at > now
}

/// Process-local duplicate suppression.
pub struct LocalSuppressor {
    ttl: Duration,
    cleanup_threshold: usize,
    entries: Mutex<HashMap<String, Instant>>,
}

impl LocalSuppressor {
    pub fn new(ttl: Duration) -> Self {
        Self::with_threshold(ttl, DEFAULT_CLEANUP_THRESHOLD)
    }

    pub fn from_config(config: &DedupeConfig) -> Self {
        Self::new(Duration::from_secs(config.local_ttl_secs))
    }

    pub fn with_threshold(ttl: Duration, cleanup_threshold: usize) -> Self {
        Self {
            ttl,
            cleanup_threshold,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record `key` unless it was recorded within the TTL.
    ///
    /// Returns `true` when the caller may proceed, `false` when suppressed.
    pub fn check_and_insert(&self, key: &str) -> bool {
        self.check_and_insert_at(key, Instant::now())
    }

    pub fn check_and_insert_at(&self, key: &str, now: Instant) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(expires_at) = entries.get(key)
            && *expires_at > now
        {
            tracing::debug!(key, "Send suppressed by local dedupe");
            return false;
        }

        if entries.len() >= self.cleanup_threshold {
            let before = entries.len();
            entries.retain(|_, expires_at| *expires_at > now);
            tracing::debug!(
                removed = before - entries.len(),
                remaining = entries.len(),
                "Local dedupe map cleaned up"
            );
        }

        entries.insert(key.to_string(), now + self.ttl);
        true
    }

    /// Forget a key, e.g. after the send it guarded failed.
    pub fn release(&self, key: &str) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Number of tracked keys, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LocalSuppressor {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_liveness() {
        let now = Utc::now();
        let claim = DedupeClaim {
            key: "verify:user1".to_string(),
            expires_at: now + chrono::Duration::minutes(5),
            created_at: now,
            updated_at: now,
        };
        assert!(claim_is_live(&claim, now));
        assert!(!claim_is_live(&claim, now + chrono::Duration::minutes(5)));
    }

    #[test]
    fn test_second_send_within_ttl_is_suppressed() {
        let suppressor = LocalSuppressor::new(Duration::from_secs(600));
        let t0 = Instant::now();
        assert!(suppressor.check_and_insert_at("welcome:u1", t0));
        assert!(!suppressor.check_and_insert_at("welcome:u1", t0 + Duration::from_secs(599)));
        assert!(suppressor.check_and_insert_at("welcome:u1", t0 + Duration::from_secs(600)));
    }

    #[test]
    fn test_independent_keys() {
        let suppressor = LocalSuppressor::default();
        let t0 = Instant::now();
        assert!(suppressor.check_and_insert_at("a", t0));
        assert!(suppressor.check_and_insert_at("b", t0));
        assert_eq!(suppressor.len(), 2);
    }

    #[test]
    fn test_cleanup_past_threshold() {
        let suppressor = LocalSuppressor::with_threshold(Duration::from_secs(10), 3);
        let t0 = Instant::now();
        for key in ["a", "b", "c"] {
            assert!(suppressor.check_and_insert_at(key, t0));
        }
        assert_eq!(suppressor.len(), 3);

        // Past the TTL, the next insert sweeps the expired entries first.
        assert!(suppressor.check_and_insert_at("d", t0 + Duration::from_secs(11)));
        assert_eq!(suppressor.len(), 1);
    }

    #[test]
    fn test_cleanup_keeps_live_entries() {
        let suppressor = LocalSuppressor::with_threshold(Duration::from_secs(10), 2);
        let t0 = Instant::now();
        assert!(suppressor.check_and_insert_at("a", t0));
        assert!(suppressor.check_and_insert_at("b", t0 + Duration::from_secs(5)));
        assert!(suppressor.check_and_insert_at("c", t0 + Duration::from_secs(12)));

        // "a" expired and was swept; "b" is still live.
        assert_eq!(suppressor.len(), 2);
        assert!(!suppressor.check_and_insert_at("b", t0 + Duration::from_secs(13)));
    }

    #[test]
    fn test_release() {
        let suppressor = LocalSuppressor::default();
        assert!(suppressor.check_and_insert("k"));
        suppressor.release("k");
        assert!(suppressor.is_empty());
        assert!(suppressor.check_and_insert("k"));
    }
}
