//! Fixed-window request throttling over the shared cache.
//!
//! Counters live in the cache under `ratelimit:{scope}:{window_start}` so every
//! instance sees the same count. A request must pass every scope it is checked
//! against (user, IP, global).

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use slotbook_core::{CacheOutcome, CacheStore, Clock};

/// How a check behaves when the shared counter store is not available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sensitivity {
    /// Payment-adjacent: reject when counts cannot be trusted.
    Financial,
    /// Low stakes: allow when counts cannot be trusted.
    Standard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitScope {
    pub key: String,
    pub limit: u64,
    pub window_seconds: u64,
}

impl RateLimitScope {
    pub fn new(key: impl Into<String>, limit: u64, window_seconds: u64) -> Self {
        Self {
            key: key.into(),
            limit,
            window_seconds,
        }
    }

    pub fn user(user_id: &str, limit: u64, window_seconds: u64) -> Self {
        Self::new(format!("user:{}", user_id), limit, window_seconds)
    }

    pub fn ip(addr: &str, limit: u64, window_seconds: u64) -> Self {
        Self::new(format!("ip:{}", addr), limit, window_seconds)
    }

    pub fn global(limit: u64, window_seconds: u64) -> Self {
        Self::new("global", limit, window_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub scope: String,
    /// The decision was made without the shared counter store.
    pub degraded: bool,
}

impl RateDecision {
    /// Seconds until the window that rejected this request closes. At least 1.
    pub fn retry_after_seconds(&self, now: DateTime<Utc>) -> u64 {
        (self.reset_at - now).num_seconds().max(1) as u64
    }
}

pub struct RateLimiter {
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn allow(
        &self,
        scope_key: &str,
        limit: u64,
        window_seconds: u64,
        sensitivity: Sensitivity,
    ) -> RateDecision {
        let window = window_seconds.max(1) as i64;
        let now = self.clock.now().timestamp();
        let window_start = now.div_euclid(window) * window;
        let reset_at = Utc
            .timestamp_opt(window_start + window, 0)
            .single()
            .unwrap_or_else(Utc::now);
        let key = format!("ratelimit:{}:{}", scope_key, window_start);

        let outcome = self.cache.increment(&key, 1).await;

        if let CacheOutcome::Fresh(1) | CacheOutcome::Degraded(1) = outcome {
            let ttl = Duration::from_secs(window as u64);
            match self.cache.expire(&key, ttl).await {
                CacheOutcome::Fresh(true) | CacheOutcome::Degraded(true) => {}
                CacheOutcome::Fresh(false) | CacheOutcome::Degraded(false) => {
                    warn!(key = %key, "Rate limit window vanished before its TTL was set");
                }
                CacheOutcome::Unavailable => {
                    warn!(key = %key, window_seconds = window, "Could not set TTL on rate limit window");
                }
            }
        }

        match outcome {
            CacheOutcome::Fresh(count) => {
                let count = count.max(0) as u64;
                RateDecision {
                    allowed: count <= limit,
                    remaining: limit.saturating_sub(count),
                    reset_at,
                    scope: scope_key.to_string(),
                    degraded: false,
                }
            }
            CacheOutcome::Degraded(_) | CacheOutcome::Unavailable => {
                let allowed = sensitivity == Sensitivity::Standard;
                warn!(
                    scope = %scope_key,
                    allowed,
                    "Rate limit counters degraded, failing {}",
                    if allowed { "open" } else { "closed" }
                );
                RateDecision {
                    allowed,
                    remaining: 0,
                    reset_at,
                    scope: scope_key.to_string(),
                    degraded: true,
                }
            }
        }
    }

    /// AND over every scope. The first failing scope is returned so its window
    /// drives `Retry-After`; otherwise the tightest passing scope.
    pub async fn check_all(&self, scopes: &[RateLimitScope], sensitivity: Sensitivity) -> RateDecision {
        let mut tightest: Option<RateDecision> = None;

        for scope in scopes {
            let decision = self
                .allow(&scope.key, scope.limit, scope.window_seconds, sensitivity)
                .await;
            if !decision.allowed {
                return decision;
            }
            let tighter = tightest
                .as_ref()
                .map_or(true, |t| decision.remaining < t.remaining);
            if tighter {
                tightest = Some(decision);
            }
        }

        tightest.unwrap_or_else(|| RateDecision {
            allowed: true,
            remaining: u64::MAX,
            reset_at: self.clock.now(),
            scope: "none".to_string(),
            degraded: false,
        })
    }
}
