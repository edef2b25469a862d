//! Key-value cache ports.
//!
//! Two layers:
//! - [`CacheBackend`]: a raw, fallible store (Redis, or the in-process map).
//! - [`CacheStore`]: what the engine talks to. It never fails; every result says
//!   whether it came from the shared store, from the local fallback, or not at all,
//!   so callers can pick a conservative policy.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("Cache connection failed: {0}")]
    Connection(String),
    #[error("Cache command failed: {0}")]
    Command(String),
    #[error("Value at {0} is not an integer")]
    NotAnInteger(String),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;
    async fn increment(&self, key: &str, by: i64) -> Result<i64, CacheError>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError>;
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
}

/// Result of a [`CacheStore`] operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheOutcome<T> {
    /// Served by the shared store.
    Fresh(T),
    /// Served by the process-local fallback. Cross-instance guarantees are lost.
    Degraded(T),
    /// Neither store could serve the request.
    Unavailable,
}

impl<T> CacheOutcome<T> {
    pub fn is_degraded(&self) -> bool {
        !matches!(self, CacheOutcome::Fresh(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            CacheOutcome::Fresh(v) | CacheOutcome::Degraded(v) => Some(v),
            CacheOutcome::Unavailable => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            CacheOutcome::Fresh(v) | CacheOutcome::Degraded(v) => Some(v),
            CacheOutcome::Unavailable => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheOutcome<U> {
        match self {
            CacheOutcome::Fresh(v) => CacheOutcome::Fresh(f(v)),
            CacheOutcome::Degraded(v) => CacheOutcome::Degraded(f(v)),
            CacheOutcome::Unavailable => CacheOutcome::Unavailable,
        }
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheOutcome<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheOutcome<()>;
    async fn delete(&self, key: &str) -> CacheOutcome<bool>;
    async fn increment(&self, key: &str, by: i64) -> CacheOutcome<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> CacheOutcome<bool>;
    async fn exists(&self, key: &str) -> CacheOutcome<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local map with the same TTL semantics as the remote store.
/// Serves as the degraded fallback and as the store for single-node runs.
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn deadline(&self, ttl: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(ttl).ok().map(|d| self.clock.now() + d)
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<String, Entry>, DateTime<Utc>) -> R) -> R {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.is_live(now));
        f(&mut entries, now)
    }

    pub fn len(&self) -> usize {
        self.with_entries(|entries, _| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        Ok(self.with_entries(|entries, _| entries.get(key).map(|e| e.value.clone())))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let expires_at = ttl.and_then(|t| self.deadline(t));
        self.with_entries(|entries, _| {
            entries.insert(key.to_string(), Entry { value: value.to_string(), expires_at });
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.with_entries(|entries, _| entries.remove(key).is_some()))
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, CacheError> {
        self.with_entries(|entries, _| {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: "0".to_string(),
                expires_at: None,
            });
            let current: i64 = entry
                .value
                .parse()
                .map_err(|_| CacheError::NotAnInteger(key.to_string()))?;
            let next = current + by;
            entry.value = next.to_string();
            Ok(next)
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, CacheError> {
        let expires_at = self.deadline(ttl);
        Ok(self.with_entries(|entries, _| match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = expires_at;
                true
            }
            None => false,
        }))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.with_entries(|entries, _| entries.contains_key(key)))
    }
}

/// A lone in-process cache is the authoritative store for its process.
#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &str) -> CacheOutcome<Option<String>> {
        local(CacheBackend::get(self, key).await)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> CacheOutcome<()> {
        local(CacheBackend::set(self, key, value, ttl).await)
    }

    async fn delete(&self, key: &str) -> CacheOutcome<bool> {
        local(CacheBackend::delete(self, key).await)
    }

    async fn increment(&self, key: &str, by: i64) -> CacheOutcome<i64> {
        local(CacheBackend::increment(self, key, by).await)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> CacheOutcome<bool> {
        local(CacheBackend::expire(self, key, ttl).await)
    }

    async fn exists(&self, key: &str) -> CacheOutcome<bool> {
        local(CacheBackend::exists(self, key).await)
    }
}

fn local<T>(result: Result<T, CacheError>) -> CacheOutcome<T> {
    match result {
        Ok(v) => CacheOutcome::Fresh(v),
        Err(e) => {
            tracing::error!("In-process cache operation failed: {}", e);
            CacheOutcome::Unavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_ttl_expiry() {
        let clock = Arc::new(ManualClock::default());
        let cache = InMemoryCache::with_clock(clock.clone());

        CacheBackend::set(&cache, "k", "v", Some(Duration::from_secs(10))).await.unwrap();
        assert_eq!(CacheBackend::get(&cache, "k").await.unwrap().as_deref(), Some("v"));

        clock.advance(chrono::Duration::seconds(11));
        assert_eq!(CacheBackend::get(&cache, "k").await.unwrap(), None);
        assert!(!CacheBackend::exists(&cache, "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_increment_and_expire() {
        let clock = Arc::new(ManualClock::default());
        let cache = InMemoryCache::with_clock(clock.clone());

        assert_eq!(CacheBackend::increment(&cache, "c", 1).await.unwrap(), 1);
        assert_eq!(CacheBackend::increment(&cache, "c", 2).await.unwrap(), 3);
        assert!(CacheBackend::expire(&cache, "c", Duration::from_secs(5)).await.unwrap());

        clock.advance(chrono::Duration::seconds(6));
        assert_eq!(CacheBackend::increment(&cache, "c", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_increment_rejects_non_integer() {
        let cache = InMemoryCache::new();
        CacheBackend::set(&cache, "s", "abc", None).await.unwrap();
        assert!(matches!(
            CacheBackend::increment(&cache, "s", 1).await,
            Err(CacheError::NotAnInteger(_))
        ));
        assert_eq!(CacheStore::increment(&cache, "s", 1).await, CacheOutcome::Unavailable);
    }

    #[tokio::test]
    async fn test_store_view_is_fresh() {
        let cache = InMemoryCache::new();
        assert_eq!(CacheStore::set(&cache, "a", "1", None).await, CacheOutcome::Fresh(()));
        assert_eq!(CacheStore::exists(&cache, "a").await, CacheOutcome::Fresh(true));
        assert_eq!(CacheStore::delete(&cache, "a").await, CacheOutcome::Fresh(true));
    }
}
