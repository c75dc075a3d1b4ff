//! Per-identity rate limiting — fixed window, single-writer.
//!
//! Each identity (`issuer:subject`) gets a bucket holding a window start and
//! a count. All mutations for one identity happen under the `DashMap` entry
//! guard, so concurrent `consume` calls observe a total order and the
//! capacity is never over-issued.
//!
//! The trait exists so the limiter transport stays an implementation detail:
//! the pipeline only distinguishes "denied" (429) from "limiter unreachable"
//! (503).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Default window size.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default per-identity capacity within one window.
pub const DEFAULT_CAPACITY: u32 = 30;

/// Outcome of a `consume` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether this request may proceed.
    pub allowed: bool,
    /// Tokens left in the current window after this call.
    pub remaining: u32,
    /// When the current window rolls over.
    pub reset_at: DateTime<Utc>,
}

/// The limiter backend could not be reached.
#[derive(Debug, thiserror::Error)]
#[error("Rate limiter unavailable: {0}")]
pub struct RateLimitUnavailable(pub String);

/// Rate limiter interface consumed by the signing pipeline.
#[async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    /// Consume one token for `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitUnavailable`] only when the limiter state itself
    /// cannot be reached; a denial is an `Ok` decision with
    /// `allowed == false`.
    async fn consume(&self, identity: &str) -> Result<RateLimitDecision, RateLimitUnavailable>;
}

/// Per-identity window state.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: DateTime<Utc>,
    count: u32,
}

/// In-process fixed-window limiter.
pub struct FixedWindowLimiter {
    buckets: DashMap<String, Bucket>,
    window: chrono::Duration,
    capacity: u32,
}

impl FixedWindowLimiter {
    /// Create a limiter with the given window and capacity.
    #[must_use]
    pub fn new(window: Duration, capacity: u32) -> Self {
        Self {
            buckets: DashMap::new(),
            window: chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(60)),
            capacity,
        }
    }

    fn decide(&self, identity: &str, now: DateTime<Utc>) -> RateLimitDecision {
        // The entry guard serializes all mutations for this identity.
        let mut entry = self
            .buckets
            .entry(identity.to_string())
            .or_insert(Bucket {
                window_start: now,
                count: 0,
            });
        let bucket = entry.value_mut();

        if now - bucket.window_start >= self.window {
            bucket.window_start = now;
            bucket.count = 0;
        }

        let reset_at = bucket.window_start + self.window;

        if bucket.count >= self.capacity {
            return RateLimitDecision {
                allowed: false,
                remaining: 0,
                reset_at,
            };
        }

        bucket.count += 1;
        RateLimitDecision {
            allowed: true,
            remaining: self.capacity - bucket.count,
            reset_at,
        }
    }
}

impl Default for FixedWindowLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW, DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn consume(&self, identity: &str) -> Result<RateLimitDecision, RateLimitUnavailable> {
        Ok(self.decide(identity, Utc::now()))
    }
}
