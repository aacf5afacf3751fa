//! Response cache for read requests
//!
//! Keeps decoded response bodies keyed by a digest of the request. Each entry
//! remembers the policy and maximum age it was stored under: entries stored
//! for `UseCacheElseLoad` expire after that age and are purged by the owning
//! transport, entries stored for `UseCacheIfOffline` are kept until replaced
//! so they can stand in for an unreachable server.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::value::Value;

/// Cache policy for read operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Always go to the network.
    #[default]
    IgnoreCache,
    /// Network first; use a cached body only when the server is unreachable.
    UseCacheIfOffline,
    /// Cached body when fresh enough, network otherwise.
    UseCacheElseLoad,
}

/// A stored response body
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub body: Value,
    pub received_at: Instant,
    pub policy: CachePolicy,
    pub max_age: Duration,
}

impl CacheEntry {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.received_at)
    }

    pub fn is_fresh(&self, max_age: Duration, now: Instant) -> bool {
        self.age(now) <= max_age
    }

    /// Past its own maximum age. Offline fallback entries never expire.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.policy == CachePolicy::UseCacheElseLoad && !self.is_fresh(self.max_age, now)
    }
}

/// Build the cache key for a request: hex SHA-256 of method, URL and body.
pub fn cache_key(method: &str, url: &str, body: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b" ");
    hasher.update(url.as_bytes());
    hasher.update(b" ");
    if let Some(body) = body {
        hasher.update(body.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// In-memory response cache. Owned by the request worker, so it needs no locking.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: HashMap<String, CacheEntry>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get an entry regardless of its age
    pub fn get(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Get an entry only if it is no older than `max_age`
    pub fn get_fresh(&self, key: &str, max_age: Duration, now: Instant) -> Option<&CacheEntry> {
        self.entries
            .get(key)
            .filter(|entry| entry.is_fresh(max_age, now))
    }

    /// Store a body, replacing any previous entry for the key
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        body: Value,
        policy: CachePolicy,
        max_age: Duration,
        now: Instant,
    ) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                body,
                received_at: now,
                policy,
                max_age,
            },
        );
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Drop every expired entry, returns how many were dropped
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
