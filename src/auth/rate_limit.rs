use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::config::{RateLimitPolicyConfig, RateLimitSettings};
use crate::reaper::Reaper;
use crate::sources::Clock;

/// Bucket parameters for one named policy ("login", "api", "sms", ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub capacity: u32,
    pub refill_rate: u32,
    pub refill_interval: Duration,
    pub error_message: String,
}

impl RateLimitPolicy {
    pub fn new(capacity: u32, refill_rate: u32, refill_interval: Duration) -> Self {
        Self {
            capacity,
            refill_rate,
            refill_interval,
            error_message: "Too many requests".to_string(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = message.into();
        self
    }

    /// Seconds a throttled caller should wait before the next token can appear.
    pub fn retry_after_secs(&self) -> u64 {
        self.refill_interval.num_seconds().max(1) as u64
    }
}

impl From<&RateLimitPolicyConfig> for RateLimitPolicy {
    fn from(config: &RateLimitPolicyConfig) -> Self {
        Self {
            capacity: config.capacity,
            refill_rate: config.refill_rate,
            refill_interval: Duration::seconds(config.refill_interval_secs as i64),
            error_message: config.error_message.clone(),
        }
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    last_refill: DateTime<Utc>,
}

/// Single-key token bucket with lazy, whole-interval refill.
///
/// `last_refill` advances by exactly the number of elapsed intervals, never
/// snapping to "now", so interval boundaries stay fixed relative to creation.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: u32,
    refill_interval_ms: i64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Starts full.
    pub fn new(policy: &RateLimitPolicy, now: DateTime<Utc>) -> Self {
        Self {
            capacity: policy.capacity,
            refill_rate: policy.refill_rate,
            refill_interval_ms: policy.refill_interval.num_milliseconds().max(1),
            state: Mutex::new(BucketState {
                tokens: policy.capacity,
                last_refill: now,
            }),
        }
    }

    pub fn allow(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();

        let elapsed_ms = (now - state.last_refill).num_milliseconds();
        let intervals = elapsed_ms / self.refill_interval_ms;
        if intervals >= 1 {
            let added = (intervals as u64).saturating_mul(self.refill_rate as u64);
            state.tokens = (state.tokens as u64 + added).min(self.capacity as u64) as u32;
            state.last_refill = state.last_refill + Duration::milliseconds(intervals * self.refill_interval_ms);
        }

        if state.tokens > 0 {
            state.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> u32 {
        self.state.lock().tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn last_refill(&self) -> DateTime<Utc> {
        self.state.lock().last_refill
    }
}

/// All buckets belonging to one caller identity.
#[derive(Debug)]
struct Visitor {
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
    last_seen: Mutex<DateTime<Utc>>,
}

impl Visitor {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            last_seen: Mutex::new(now),
        }
    }

    fn touch(&self, now: DateTime<Utc>) {
        let mut last_seen = self.last_seen.lock();
        if now > *last_seen {
            *last_seen = now;
        }
    }

    fn bucket(&self, endpoint: &str, policy: &RateLimitPolicy, now: DateTime<Utc>) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.read().get(endpoint) {
            return bucket.clone();
        }
        self.buckets
            .write()
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(policy, now)))
            .clone()
    }
}

/// Per-(identity, endpoint) token buckets with a background reaper for idle identities.
///
/// Lock order: the identity map's RwLock is held only while looking up or
/// inserting a visitor; bucket arithmetic runs under the bucket's own mutex
/// after every map lock is released.
pub struct RateLimiter {
    visitors: RwLock<HashMap<String, Arc<Visitor>>>,
    retention: Duration,
    clock: Arc<dyn Clock>,
    reaper: Reaper,
}

impl RateLimiter {
    pub fn new(retention: Duration, reap_interval: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            visitors: RwLock::new(HashMap::new()),
            retention,
            clock,
            reaper: Reaper::new("rate-limit-visitors", reap_interval),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            Duration::hours(settings.retention_hours),
            std::time::Duration::from_secs(settings.reap_interval_secs),
            clock,
        )
    }

    /// Never errors: callers turn `false` into a throttling response.
    pub fn allow(&self, identity: &str, endpoint: &str, policy: &RateLimitPolicy) -> bool {
        let now = self.clock.now();
        let visitor = self.visitor(identity, now);
        visitor.touch(now);
        let allowed = visitor.bucket(endpoint, policy, now).allow(now);
        if !allowed {
            warn!(identity = %identity, endpoint = %endpoint, "rate limit exceeded");
        }
        allowed
    }

    fn visitor(&self, identity: &str, now: DateTime<Utc>) -> Arc<Visitor> {
        if let Some(visitor) = self.visitors.read().get(identity) {
            return visitor.clone();
        }
        self.visitors
            .write()
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Visitor::new(now)))
            .clone()
    }

    /// Drops identities idle for at least the retention window.
    pub fn reap(&self) -> usize {
        let cutoff = self.clock.now() - self.retention;
        let mut visitors = self.visitors.write();
        let before = visitors.len();
        visitors.retain(|_, visitor| *visitor.last_seen.lock() > cutoff);
        let removed = before - visitors.len();
        debug!(removed, remaining = visitors.len(), "reaped idle rate-limit visitors");
        removed
    }

    pub fn visitor_count(&self) -> usize {
        self.visitors.read().len()
    }

    pub fn start(self: &Arc<Self>) {
        let limiter: Weak<Self> = Arc::downgrade(self);
        self.reaper.start(move || {
            let limiter = limiter.clone();
            async move {
                if let Some(limiter) = limiter.upgrade() {
                    limiter.reap();
                }
            }
        });
    }

    pub async fn stop(&self) {
        self.reaper.stop().await;
    }

    pub fn is_running(&self) -> bool {
        self.reaper.is_running()
    }
}
