use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use slotbook_core::{CacheBackend, CacheError, CacheOutcome, CacheStore, InMemoryCache};

use crate::app_config::CacheConfig;

enum Attempt<T> {
    Done(T),
    Down,
    Failed,
}

/// Remote cache with bounded retries and a process-local fallback.
///
/// Only connection failures are retried. When retries run out the operation is
/// served by the local map and reported as [`CacheOutcome::Degraded`].
pub struct ResilientCache {
    primary: Arc<dyn CacheBackend>,
    fallback: InMemoryCache,
    max_retries: u32,
    backoff: Duration,
    fallback_enabled: bool,
    degraded: AtomicBool,
}

impl ResilientCache {
    pub fn new(
        primary: Arc<dyn CacheBackend>,
        max_retries: u32,
        backoff: Duration,
        fallback_enabled: bool,
    ) -> Self {
        Self {
            primary,
            fallback: InMemoryCache::new(),
            max_retries,
            backoff,
            fallback_enabled,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn from_config(primary: Arc<dyn CacheBackend>, config: &CacheConfig) -> Self {
        Self::new(
            primary,
            config.max_retries,
            Duration::from_millis(config.retry_backoff_ms),
            config.fallback_enabled,
        )
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    async fn attempt<T, F, Fut>(&self, op: &'static str, key: &str, call: F) -> Attempt<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        for attempt in 0..=self.max_retries {
            match call().await {
                Ok(value) => {
                    if self.degraded.swap(false, Ordering::SeqCst) {
                        info!("Shared cache reachable again, leaving degraded mode");
                    }
                    return Attempt::Done(value);
                }
                Err(CacheError::Connection(msg)) => {
                    debug!(op, key = %key, attempt, "Cache connection failed: {}", msg);
                    if attempt < self.max_retries {
                        tokio::time::sleep(self.backoff * (attempt + 1)).await;
                    }
                }
                Err(e) => {
                    error!(op, key = %key, "Cache command failed: {}", e);
                    return Attempt::Failed;
                }
            }
        }
        Attempt::Down
    }

    async fn degrade<T, Fut>(&self, op: &'static str, key: &str, local: Fut) -> CacheOutcome<T>
    where
        Fut: Future<Output = Result<T, CacheError>>,
    {
        if !self.fallback_enabled {
            warn!(op, key = %key, "Shared cache unreachable and fallback disabled");
            return CacheOutcome::Unavailable;
        }

        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!("Shared cache unreachable, serving from local fallback (degraded)");
        }

        match local.await {
            Ok(value) => CacheOutcome::Degraded(value),
            Err(e) => {
                error!(op, key = %key, "Local fallback failed: {}", e);
                CacheOutcome::Unavailable
            }
        }
    }
}

#[async_trait]
impl CacheStore for ResilientCache {
    async fn get(&self, key: &str) -> CacheOutcome<Option<String>> {
        match self.attempt("get", key, || self.primary.get(key)).await {
            Attempt::Done(v) => CacheOutcome::Fresh(v),
            Attempt::Failed => CacheOutcome::Unavailable,
            Attempt::Down => self.degrade("get", key, CacheBackend::get(&self.fallback, key)).await,
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheOutcome<()> {
        match self.attempt("set", key, || self.primary.set(key, value, ttl)).await {
            Attempt::Done(v) => CacheOutcome::Fresh(v),
            Attempt::Failed => CacheOutcome::Unavailable,
            Attempt::Down => {
                self.degrade("set", key, CacheBackend::set(&self.fallback, key, value, ttl))
                    .await
            }
        }
    }

    async fn delete(&self, key: &str) -> CacheOutcome<bool> {
        match self.attempt("delete", key, || self.primary.delete(key)).await {
            Attempt::Done(v) => CacheOutcome::Fresh(v),
            Attempt::Failed => CacheOutcome::Unavailable,
            Attempt::Down => {
                self.degrade("delete", key, CacheBackend::delete(&self.fallback, key))
                    .await
            }
        }
    }

    async fn increment(&self, key: &str, by: i64) -> CacheOutcome<i64> {
        match self.attempt("increment", key, || self.primary.increment(key, by)).await {
            Attempt::Done(v) => CacheOutcome::Fresh(v),
            Attempt::Failed => CacheOutcome::Unavailable,
            Attempt::Down => {
                self.degrade("increment", key, CacheBackend::increment(&self.fallback, key, by))
                    .await
            }
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheOutcome<bool> {
        match self.attempt("expire", key, || self.primary.expire(key, ttl)).await {
            Attempt::Done(v) => CacheOutcome::Fresh(v),
            Attempt::Failed => CacheOutcome::Unavailable,
            Attempt::Down => {
                self.degrade("expire", key, CacheBackend::expire(&self.fallback, key, ttl))
                    .await
            }
        }
    }

    async fn exists(&self, key: &str) -> CacheOutcome<bool> {
        match self.attempt("exists", key, || self.primary.exists(key)).await {
            Attempt::Done(v) => CacheOutcome::Fresh(v),
            Attempt::Failed => CacheOutcome::Unavailable,
            Attempt::Down => {
                self.degrade("exists", key, CacheBackend::exists(&self.fallback, key))
                    .await
            }
        }
    }
}
