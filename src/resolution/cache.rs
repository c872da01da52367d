//! TTL cache of resolved id sets, keyed by normalized sub-query.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

#[derive(Debug, Clone)]
struct CachedIds {
    ids: Arc<Vec<String>>,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct ResolutionCache {
    entries: DashMap<String, CachedIds>,
    ttl: Duration,
}

impl ResolutionCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<Vec<String>>> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.ids.clone()),
            _ => None,
        }
    }

    pub fn insert(&self, key: String, ids: Vec<String>) -> Arc<Vec<String>> {
        let ids = Arc::new(ids);
        if !self.ttl.is_zero() {
            self.entries.insert(
                key,
                CachedIds {
                    ids: ids.clone(),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
        ids
    }

    /// Remove up to `limit` expired entries. Returns how many were removed.
    pub fn sweep(&self, limit: usize) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .take(limit)
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.entries.remove_if(key, |_, v| v.expires_at <= now);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
