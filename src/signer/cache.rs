//! Decrypted-key cache with TTL expiry.
//!
//! Parsing and unlocking an armored private key costs real CPU (S2K key
//! derivation); steady-state signing should pay it once per TTL window, not
//! once per request. Entries are process-local and never serialized. The
//! cache is purely a latency optimization: callers must tolerate absence and
//! re-parse.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

use super::UnlockedKey;

/// Default time-to-live for an unlocked key handle.
pub const DEFAULT_KEY_TTL: Duration = Duration::from_secs(300);

/// A cached handle with its expiry.
struct CachedKey {
    key: Arc<UnlockedKey>,
    expires_at: Instant,
}

/// Thread-safe `keyId → UnlockedKey` cache.
///
/// Concurrent misses for the same key may both parse and both insert; the
/// handles are equivalent and the last writer wins.
pub struct DecryptedKeyCache {
    entries: DashMap<String, CachedKey>,
    ttl: Duration,
}

impl DecryptedKeyCache {
    /// Create a cache with the given TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Return the handle for `key_id` if present and unexpired.
    ///
    /// Expired entries are evicted on access.
    pub fn get(&self, key_id: &str) -> Option<Arc<UnlockedKey>> {
        let entry = self.entries.get(key_id)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(key_id);
            return None;
        }
        Some(Arc::clone(&entry.key))
    }

    /// Insert or replace the handle for `key_id` with a fresh TTL.
    pub fn set(&self, key_id: &str, key: Arc<UnlockedKey>) {
        self.entries.insert(
            key_id.to_string(),
            CachedKey {
                key,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    /// Drop the entry for `key_id` (e.g. after a key delete or rotation).
    pub fn invalidate(&self, key_id: &str) {
        self.entries.remove(key_id);
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Sweep expired entries and report current size and TTL.
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);

        CacheStats {
            size: self.entries.len(),
            ttl_secs: self.ttl.as_secs(),
        }
    }
}

impl Default for DecryptedKeyCache {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_TTL)
    }
}

/// Snapshot returned by [`DecryptedKeyCache::stats`].
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Live (unexpired) entries.
    pub size: usize,
    /// Configured TTL in seconds.
    pub ttl_secs: u64,
}
