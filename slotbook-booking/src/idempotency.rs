use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use slotbook_core::{CacheOutcome, CacheStore, Clock};

const KEY_PREFIX: &str = "idempotency";
const MAX_KEY_LEN: usize = 255;

/// What we keep for a handled request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub result_snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdempotencyError {
    #[error("Idempotency key must be 1..=255 printable characters")]
    InvalidKey,
}

/// Replays stored responses for retried mutating requests.
///
/// `check` then `record` is two cache calls, not one: two identical requests
/// racing can both miss. Money is still safe because settlement enforces its
/// own uniqueness per gateway session.
pub struct IdempotencyLedger {
    cache: Arc<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl IdempotencyLedger {
    pub fn new(cache: Arc<dyn CacheStore>, clock: Arc<dyn Clock>, default_ttl: Duration) -> Self {
        Self { cache, clock, default_ttl }
    }

    /// Keys are scoped per operation so `checkout:abc` never collides with `approval:abc`.
    fn scoped_key(operation: &str, key: &str) -> Result<String, IdempotencyError> {
        if key.is_empty() || key.len() > MAX_KEY_LEN || key.chars().any(|c| c.is_control()) {
            return Err(IdempotencyError::InvalidKey);
        }
        Ok(format!("{}:{}:{}", KEY_PREFIX, operation, key))
    }

    pub async fn check<T: DeserializeOwned>(
        &self,
        operation: &str,
        key: &str,
    ) -> Result<Option<T>, IdempotencyError> {
        let scoped = Self::scoped_key(operation, key)?;

        let raw = match self.cache.get(&scoped).await {
            CacheOutcome::Fresh(v) => v,
            CacheOutcome::Degraded(v) => {
                debug!(key = %scoped, "Idempotency lookup served from local fallback");
                v
            }
            CacheOutcome::Unavailable => {
                warn!(key = %scoped, "Idempotency lookup unavailable, executing request");
                None
            }
        };

        let Some(raw) = raw else {
            return Ok(None);
        };

        let replay = serde_json::from_str::<IdempotencyRecord>(&raw)
            .and_then(|record| serde_json::from_value::<T>(record.result_snapshot));

        match replay {
            Ok(result) => {
                debug!(key = %scoped, "Replaying stored result");
                Ok(Some(result))
            }
            Err(e) => {
                warn!(key = %scoped, "Discarding unreadable idempotency record: {}", e);
                Ok(None)
            }
        }
    }

    /// Store `result` for replay. Returns whether it reached the shared store.
    pub async fn record<T: Serialize>(
        &self,
        operation: &str,
        key: &str,
        result: &T,
        ttl: Option<Duration>,
    ) -> Result<bool, IdempotencyError> {
        let scoped = Self::scoped_key(operation, key)?;

        let snapshot = match serde_json::to_value(result) {
            Ok(v) => v,
            Err(e) => {
                warn!(key = %scoped, "Cannot snapshot result for idempotency: {}", e);
                return Ok(false);
            }
        };

        let record = IdempotencyRecord {
            key: key.to_string(),
            result_snapshot: snapshot,
            created_at: self.clock.now(),
        };

        let Ok(encoded) = serde_json::to_string(&record) else {
            return Ok(false);
        };

        let outcome = self
            .cache
            .set(&scoped, &encoded, Some(ttl.unwrap_or(self.default_ttl)))
            .await;

        Ok(matches!(outcome, CacheOutcome::Fresh(())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotbook_core::{InMemoryCache, ManualClock};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Receipt {
        reservation_id: String,
    }

    fn ledger() -> (IdempotencyLedger, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let cache = Arc::new(InMemoryCache::with_clock(clock.clone()));
        (
            IdempotencyLedger::new(cache, clock.clone(), Duration::from_secs(600)),
            clock,
        )
    }

    #[tokio::test]
    async fn test_replay_within_ttl() {
        let (ledger, clock) = ledger();
        let receipt = Receipt { reservation_id: "r1".into() };

        assert_eq!(ledger.check::<Receipt>("checkout", "k1").await.unwrap(), None);
        assert!(ledger.record("checkout", "k1", &receipt, None).await.unwrap());
        assert_eq!(ledger.check::<Receipt>("checkout", "k1").await.unwrap(), Some(receipt));

        clock.advance(chrono::Duration::seconds(601));
        assert_eq!(ledger.check::<Receipt>("checkout", "k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_operations_are_isolated() {
        let (ledger, _) = ledger();
        let receipt = Receipt { reservation_id: "r1".into() };
        ledger.record("checkout", "same", &receipt, None).await.unwrap();
        assert_eq!(ledger.check::<Receipt>("approval", "same").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_bad_keys() {
        let (ledger, _) = ledger();
        assert_eq!(
            ledger.check::<Receipt>("checkout", "").await,
            Err(IdempotencyError::InvalidKey)
        );
        let long = "x".repeat(256);
        assert_eq!(
            ledger.check::<Receipt>("checkout", &long).await,
            Err(IdempotencyError::InvalidKey)
        );
    }
}
