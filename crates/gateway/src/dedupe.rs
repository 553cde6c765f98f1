use std::collections::HashMap;

use serde_json::Value;

use clawdis_protocol::{DEDUPE_MAX_ENTRIES, DEDUPE_TTL_MS, ErrorShape, ResponseFrame, now_ms};

/// The completed outcome of a mutating request, replayed verbatim for any
/// later request carrying the same idempotency key.
#[derive(Debug, Clone)]
pub struct CachedOutcome {
    pub ts: u64,
    pub ok: bool,
    pub payload: Option<Value>,
    pub error: Option<ErrorShape>,
}

impl CachedOutcome {
    pub fn success(payload: Value) -> Self {
        Self {
            ts: now_ms(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn failure(error: ErrorShape) -> Self {
        Self {
            ts: now_ms(),
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Rebuild the response frame for a replay, correlated to the new request.
    pub fn to_response(&self, request_id: &str) -> ResponseFrame {
        ResponseFrame {
            id: request_id.to_string(),
            ok: self.ok,
            payload: self.payload.clone(),
            error: self.error.clone(),
        }
    }
}

/// TTL + capacity-bounded idempotency cache, process-global so replay works
/// across reconnects from the same or different clients.
pub struct DedupeCache {
    entries: HashMap<String, CachedOutcome>,
    ttl_ms: u64,
    max_entries: usize,
}

impl Default for DedupeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupeCache {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ttl_ms: DEDUPE_TTL_MS,
            max_entries: DEDUPE_MAX_ENTRIES,
        }
    }

    /// Flat key namespace: callers pick globally unique idempotency keys.
    pub fn key(method: &str, idempotency_key: &str) -> String {
        format!("{method}:{idempotency_key}")
    }

    pub fn lookup(&self, key: &str) -> Option<CachedOutcome> {
        self.lookup_at(key, now_ms())
    }

    fn lookup_at(&self, key: &str, now: u64) -> Option<CachedOutcome> {
        self.entries
            .get(key)
            .filter(|entry| now.saturating_sub(entry.ts) < self.ttl_ms)
            .cloned()
    }

    /// Insert-or-replace, atomic per key under the surrounding lock.
    pub fn store(&mut self, key: &str, outcome: CachedOutcome) {
        self.entries.insert(key.to_string(), outcome);
        self.enforce_cap();
    }

    /// Periodic sweep: drop expired entries, then evict oldest-by-timestamp
    /// until back at the cap.
    pub fn sweep(&mut self) {
        self.sweep_at(now_ms());
    }

    fn sweep_at(&mut self, now: u64) {
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.ts) < self.ttl_ms);
        self.enforce_cap();
    }

    fn enforce_cap(&mut self) {
        while self.entries.len() > self.max_entries {
            let Some(oldest_key) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.ts)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            self.entries.remove(&oldest_key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn outcome_at(ts: u64, tag: &str) -> CachedOutcome {
        CachedOutcome {
            ts,
            ok: true,
            payload: Some(json!({ "tag": tag })),
            error: None,
        }
    }

    #[test]
    fn replay_returns_the_stored_outcome_verbatim() {
        let mut cache = DedupeCache::new();
        let key = DedupeCache::key("send", "K");
        cache.store(&key, CachedOutcome::success(json!({ "runId": "K" })));

        let replay = cache.lookup(&key).unwrap();
        let response = replay.to_response("b1");
        assert_eq!(response.id, "b1");
        assert!(response.ok);
        assert_eq!(response.payload, Some(json!({ "runId": "K" })));
    }

    #[test]
    fn failures_are_cached_too() {
        let mut cache = DedupeCache::new();
        let key = DedupeCache::key("send", "K");
        cache.store(&key, CachedOutcome::failure(ErrorShape::unavailable("down")));

        let replay = cache.lookup(&key).unwrap();
        assert!(!replay.ok);
        assert_eq!(replay.error.unwrap().code, "UNAVAILABLE");
    }

    #[test]
    fn entries_expire_after_ttl() {
        let mut cache = DedupeCache::new();
        cache.store("send:K", outcome_at(1_000, "a"));
        assert!(cache.lookup_at("send:K", 1_000 + DEDUPE_TTL_MS - 1).is_some());
        assert!(cache.lookup_at("send:K", 1_000 + DEDUPE_TTL_MS).is_none());
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let mut cache = DedupeCache::new();
        cache.store("send:old", outcome_at(1_000, "old"));
        cache.store("send:new", outcome_at(2_000 + DEDUPE_TTL_MS, "new"));
        cache.sweep_at(2_000 + DEDUPE_TTL_MS);
        assert_eq!(cache.len(), 1);
        assert!(cache.lookup_at("send:new", 2_000 + DEDUPE_TTL_MS).is_some());
    }

    #[test]
    fn cap_evicts_oldest_by_timestamp() {
        let mut cache = DedupeCache::new();
        for i in 0..DEDUPE_MAX_ENTRIES as u64 + 5 {
            cache.store(&format!("send:{i}"), outcome_at(i + 1, "x"));
        }
        assert_eq!(cache.len(), DEDUPE_MAX_ENTRIES);
        // The five oldest keys are gone.
        for i in 0..5 {
            assert!(cache.lookup_at(&format!("send:{i}"), 10).is_none());
        }
    }

    #[test]
    fn methods_do_not_share_keys() {
        assert_ne!(DedupeCache::key("send", "K"), DedupeCache::key("agent", "K"));
    }
}
