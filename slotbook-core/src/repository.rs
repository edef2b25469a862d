use async_trait::async_trait;
use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::booking::{BookingStatus, Meeting, Money};
use crate::hold::{ConsumeOutcome, HoldOutcome, ReleaseOutcome, SlotReservation};
use crate::payment::{PaymentSession, SettlementState};
use crate::refund::RefundRecord;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// Connection, timeout, serialization failure. The caller may retry.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Stored data is invalid: {0}")]
    Corrupt(String),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Durable reservation storage. The only place slot exclusivity is enforced.
#[async_trait]
pub trait ReservationRepository: Send + Sync {
    /// Expire stale holds on the slot, then insert `reservation` unless a live
    /// HELD/CONSUMED reservation overlaps it. Must be a single atomic step.
    async fn insert_hold(
        &self,
        reservation: &SlotReservation,
        now: DateTime<Utc>,
    ) -> RepositoryResult<HoldOutcome>;

    async fn find_reservation(&self, id: Uuid) -> RepositoryResult<Option<SlotReservation>>;

    /// Record the gateway session paying for a HELD reservation. Returns false
    /// when the reservation is no longer HELD.
    async fn attach_session(&self, id: Uuid, gateway_session_id: &str) -> RepositoryResult<bool>;

    /// HELD → CONSUMED plus meeting creation in one transaction.
    async fn consume(
        &self,
        id: Uuid,
        gateway_session_id: &str,
        amount: &Money,
        now: DateTime<Utc>,
    ) -> RepositoryResult<ConsumeOutcome>;

    async fn release(&self, id: Uuid, now: DateTime<Utc>) -> RepositoryResult<ReleaseOutcome>;
}

#[async_trait]
pub trait MeetingRepository: Send + Sync {
    async fn find_meeting(&self, id: Uuid) -> RepositoryResult<Option<Meeting>>;

    async fn find_meeting_by_payment(&self, gateway_session_id: &str) -> RepositoryResult<Option<Meeting>>;

    async fn update_meeting_status(
        &self,
        id: Uuid,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()>;
}

#[async_trait]
pub trait PaymentSessionRepository: Send + Sync {
    /// Returns false if the session already exists.
    async fn create_session(&self, session: &PaymentSession) -> RepositoryResult<bool>;

    async fn find_session(&self, gateway_session_id: &str) -> RepositoryResult<Option<PaymentSession>>;

    /// Compare-and-set: moves the session from `from` to `to` only if it is
    /// still in `from`. Returns whether the row changed.
    async fn transition_session(
        &self,
        gateway_session_id: &str,
        from: SettlementState,
        to: SettlementState,
        continuation: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool>;
}

#[async_trait]
pub trait RefundRepository: Send + Sync {
    async fn find_refund(&self, gateway_session_id: &str) -> RepositoryResult<Option<RefundRecord>>;

    /// Inserts `record` unless the session already has a refund; either way
    /// returns the stored row.
    async fn insert_refund(&self, record: &RefundRecord) -> RepositoryResult<RefundRecord>;

    /// Take ownership of one gateway attempt: succeeds only for a PENDING row
    /// that is due at `now`. Pushes `next_attempt_at` to `lease_until` and clears
    /// `last_error` so concurrent workers skip it.
    async fn claim_refund(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> RepositoryResult<bool>;

    /// Make a PENDING row whose last attempt failed due immediately.
    async fn expedite_refund(&self, id: Uuid, now: DateTime<Utc>) -> RepositoryResult<bool>;

    async fn mark_refund_issued(
        &self,
        id: Uuid,
        gateway_refund_id: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()>;

    async fn record_refund_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()>;

    async fn list_pending_refunds(&self) -> RepositoryResult<Vec<RefundRecord>>;

    async fn list_due_refunds(&self, now: DateTime<Utc>, limit: i64) -> RepositoryResult<Vec<RefundRecord>>;
}
