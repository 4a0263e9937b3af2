//! Response cache for L2 decisions.
//!
//! Keyed by `SHA-256(model | prompt)` with LRU eviction and a TTL, so a
//! burst of identical documents costs one external call.

use std::collections::{HashMap, VecDeque};

use sha2::{Digest, Sha256};

use super::Proposal;

/// Cache key for a (model, prompt) pair.
#[must_use]
pub fn cache_key(model: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update(b"|");
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
struct Slot {
    proposal: Proposal,
    expires_at: i64,
}

/// LRU + TTL cache of proposals.
#[derive(Debug)]
pub struct ResponseCache {
    map: HashMap<String, Slot>,
    order: VecDeque<String>,
    capacity: usize,
    ttl_ms: i64,
    hits: u64,
    misses: u64,
}

impl ResponseCache {
    /// Create a cache holding up to `capacity` proposals for `ttl_ms` each.
    #[must_use]
    pub fn new(capacity: usize, ttl_ms: i64) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            ttl_ms,
            hits: 0,
            misses: 0,
        }
    }

    /// Look up a fresh proposal, refreshing its recency.
    pub fn get(&mut self, key: &str, now_ms: i64) -> Option<Proposal> {
        match self.map.get(key) {
            Some(slot) if slot.expires_at > now_ms => {
                self.hits += 1;
                self.touch(key);
                Some(self.map[key].proposal.clone())
            }
            Some(_) => {
                self.map.remove(key);
                self.order.retain(|k| k != key);
                self.misses += 1;
                None
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert a proposal, evicting the least recently used slot when full.
    pub fn put(&mut self, key: String, proposal: Proposal, now_ms: i64) {
        if self.map.contains_key(&key) {
            self.order.retain(|k| k != &key);
        } else if self.map.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.map.remove(&evicted);
            }
        }
        self.map.insert(
            key.clone(),
            Slot {
                proposal,
                expires_at: now_ms + self.ttl_ms,
            },
        );
        self.order.push_back(key);
    }

    /// `(hits, misses)` since creation.
    #[must_use]
    pub const fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn touch(&mut self, key: &str) {
        self.order.retain(|k| k != key);
        self.order.push_back(key.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::InferenceLog;

    fn proposal(category: &str) -> Proposal {
        Proposal {
            category: category.to_string(),
            confidence: 0.9,
            matched_rule: None,
            inference_log: InferenceLog::default(),
            requires_shadow_audit: false,
        }
    }

    #[test]
    fn test_hit_within_ttl() {
        let mut cache = ResponseCache::new(4, 1_000);
        cache.put("k".to_string(), proposal("6601-01"), 0);

        assert_eq!(cache.get("k", 500).unwrap().category, "6601-01");
        assert!(cache.get("k", 1_500).is_none());
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_lru_eviction() {
        let mut cache = ResponseCache::new(2, 10_000);
        cache.put("a".to_string(), proposal("1"), 0);
        cache.put("b".to_string(), proposal("2"), 0);
        // Touch "a" so "b" is the eviction candidate.
        cache.get("a", 1);
        cache.put("c".to_string(), proposal("3"), 2);

        assert!(cache.get("a", 3).is_some());
        assert!(cache.get("b", 3).is_none());
        assert!(cache.get("c", 3).is_some());
    }

    #[test]
    fn test_key_differs_by_model() {
        assert_ne!(cache_key("m1", "p"), cache_key("m2", "p"));
        assert_eq!(cache_key("m", "p"), cache_key("m", "p"));
    }
}
