//! Per-key token bucket rate limiter. Hand-rolled over `tokio::time::Instant`
//! + `HashMap` rather than pulling in a crate, the same bias toward small
//! bespoke state machines `crates/codex/src/mcp/jsonrpc.rs` shows for its own
//! backoff/timeout bookkeeping.

use std::collections::HashMap;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-minute quota `R`. `allow(key)` refills proportionally to elapsed
/// time and consumes one token if available.
pub struct RateLimiter {
    per_minute: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute: per_minute as f64,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Refill `key`'s bucket to the current instant, consume one token if
    /// available, and report whether the request is allowed.
    pub async fn allow(&self, key: &str) -> bool {
        if self.per_minute <= 0.0 {
            return false;
        }
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.per_minute,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.per_minute / 60.0).min(self.per_minute);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Opportunistically drop buckets untouched for a full quota window,
    /// so a long-lived proxy doesn't accumulate one entry per distinct
    /// (possibly adversarial) token forever.
    pub async fn sweep_idle(&self, idle_for: std::time::Duration) {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;
        buckets.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) < idle_for);
    }
}
