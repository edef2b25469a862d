use chrono::Duration;
use std::sync::Arc;
use tracing::{error, info, warn};

use slotbook_core::repository::{
    MeetingRepository, PaymentSessionRepository, RefundRepository, ReservationRepository,
};
use slotbook_core::{
    BookingStatus, Clock, GatewayError, PaymentGateway, RefundRecord, RepositoryError,
    SettlementState,
};
use slotbook_shared::models::events::{NotificationKind, NotificationRequest};

use crate::dispatch::NotificationDispatcher;

/// How long one gateway attempt owns a refund row before another worker may retry it.
const ATTEMPT_LEASE_SECONDS: i64 = 120;

/// Exponential backoff between refund attempts: `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(base_seconds: i64, max_seconds: i64) -> Self {
        Self {
            base: Duration::seconds(base_seconds.max(1)),
            max: Duration::seconds(max_seconds.max(base_seconds.max(1))),
        }
    }

    pub fn delay_for(&self, attempt: i32) -> Duration {
        let exponent = (attempt.max(1) - 1).min(30) as u32;
        let factor = 2i64.saturating_pow(exponent);
        let delay = self.base.num_seconds().saturating_mul(factor);
        Duration::seconds(delay.min(self.max.num_seconds()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(30, 3600)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RetrySummary {
    pub attempted: usize,
    pub issued: usize,
    pub still_pending: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum RefundError {
    #[error("No payment session {0}")]
    UnknownSession(String),

    #[error("No refund for payment session {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] RepositoryError),
}

/// Gives money back when a payment settled for a slot it can no longer have.
///
/// The refund row per gateway session is our own guard against paying twice;
/// we do not rely on the gateway deduplicating.
pub struct RefundCoordinator {
    refunds: Arc<dyn RefundRepository>,
    meetings: Arc<dyn MeetingRepository>,
    sessions: Arc<dyn PaymentSessionRepository>,
    reservations: Arc<dyn ReservationRepository>,
    gateway: Arc<dyn PaymentGateway>,
    dispatcher: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl RefundCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        refunds: Arc<dyn RefundRepository>,
        meetings: Arc<dyn MeetingRepository>,
        sessions: Arc<dyn PaymentSessionRepository>,
        reservations: Arc<dyn ReservationRepository>,
        gateway: Arc<dyn PaymentGateway>,
        dispatcher: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            refunds,
            meetings,
            sessions,
            reservations,
            gateway,
            dispatcher,
            clock,
            policy,
        }
    }

    /// Refund the payment captured for `gateway_session_id`. Returns the refund
    /// row: ISSUED when the gateway accepted it, PENDING when it is queued for retry.
    pub async fn issue_refund(
        &self,
        gateway_session_id: &str,
        reason: &str,
    ) -> Result<RefundRecord, RefundError> {
        if let Some(existing) = self.refunds.find_refund(gateway_session_id).await? {
            if existing.is_issued() {
                info!(session_id = %gateway_session_id, "Refund already issued");
                self.finalize(&existing).await?;
                return Ok(existing);
            }
            return self.attempt(existing).await;
        }

        let session = self
            .sessions
            .find_session(gateway_session_id)
            .await?
            .ok_or_else(|| RefundError::UnknownSession(gateway_session_id.to_string()))?;

        let record = RefundRecord::pending(
            gateway_session_id,
            session.reservation_id,
            session.amount.clone(),
            reason,
            self.clock.now(),
        );
        let stored = self.refunds.insert_refund(&record).await?;
        if stored.is_issued() {
            return Ok(stored);
        }

        warn!(
            session_id = %gateway_session_id,
            reservation_id = %stored.reservation_id,
            reason = %reason,
            "Refund queued"
        );
        self.attempt(stored).await
    }

    /// Administrative approval to retry a failed refund now instead of waiting out its backoff.
    pub async fn retry_now(&self, gateway_session_id: &str) -> Result<RefundRecord, RefundError> {
        let record = self
            .refunds
            .find_refund(gateway_session_id)
            .await?
            .ok_or_else(|| RefundError::NotFound(gateway_session_id.to_string()))?;

        if record.is_issued() {
            return Ok(record);
        }

        let now = self.clock.now();
        if self.refunds.expedite_refund(record.id, now).await? {
            info!(session_id = %gateway_session_id, "Refund retry approved");
        }
        self.attempt(record).await
    }

    /// Worker entry point: one attempt for every refund whose backoff has elapsed.
    pub async fn retry_due(&self, limit: i64) -> Result<RetrySummary, RefundError> {
        let due = self.refunds.list_due_refunds(self.clock.now(), limit).await?;
        let mut summary = RetrySummary::default();

        for record in due {
            summary.attempted += 1;
            let session_id = record.gateway_session_id.clone();
            match self.attempt(record).await {
                Ok(r) if r.is_issued() => summary.issued += 1,
                Ok(_) => summary.still_pending += 1,
                Err(e) => {
                    summary.still_pending += 1;
                    error!(session_id = %session_id, "Refund retry failed: {}", e);
                }
            }
        }

        Ok(summary)
    }

    /// PENDING refunds, oldest first. Operations tooling reads this as an actionable backlog.
    pub async fn pending_backlog(&self) -> Result<Vec<RefundRecord>, RefundError> {
        Ok(self.refunds.list_pending_refunds().await?)
    }

    async fn attempt(&self, record: RefundRecord) -> Result<RefundRecord, RefundError> {
        let now = self.clock.now();
        let lease_until = now + Duration::seconds(ATTEMPT_LEASE_SECONDS);

        if !self.refunds.claim_refund(record.id, now, lease_until).await? {
            // not due yet, or another worker holds the attempt
            return Ok(self.reload(&record).await?);
        }

        let idempotency_key = format!("refund:{}", record.gateway_session_id);
        match self
            .gateway
            .refund(&record.gateway_session_id, &record.amount, &idempotency_key)
            .await
        {
            Ok(receipt) => {
                self.refunds
                    .mark_refund_issued(record.id, &receipt.gateway_refund_id, self.clock.now())
                    .await?;
                info!(
                    session_id = %record.gateway_session_id,
                    refund_id = %receipt.gateway_refund_id,
                    "Refund issued"
                );
                let issued = self.reload(&record).await?;
                self.finalize(&issued).await?;
                Ok(issued)
            }
            Err(e) => {
                let attempts = record.attempts + 1;
                let next_attempt_at = self.clock.now() + self.policy.delay_for(attempts);
                self.refunds
                    .record_refund_failure(record.id, &e.to_string(), next_attempt_at, self.clock.now())
                    .await?;
                self.log_failure(&record, attempts, &e);
                Ok(self.reload(&record).await?)
            }
        }
    }

    fn log_failure(&self, record: &RefundRecord, attempts: i32, e: &GatewayError) {
        if e.is_retryable() {
            warn!(
                session_id = %record.gateway_session_id,
                attempts,
                "Refund attempt failed, will retry: {}",
                e
            );
        } else {
            error!(
                session_id = %record.gateway_session_id,
                attempts,
                backlog = true,
                "Refund rejected by gateway, needs operator review: {}",
                e
            );
        }
    }

    async fn reload(&self, record: &RefundRecord) -> Result<RefundRecord, RepositoryError> {
        Ok(self
            .refunds
            .find_refund(&record.gateway_session_id)
            .await?
            .unwrap_or_else(|| record.clone()))
    }

    /// Bring meeting and session in line with an issued refund. Safe to repeat;
    /// the client is notified only by the call that moves the session.
    async fn finalize(&self, record: &RefundRecord) -> Result<(), RepositoryError> {
        let now = self.clock.now();

        let meeting = self
            .meetings
            .find_meeting_by_payment(&record.gateway_session_id)
            .await?;
        if let Some(meeting) = &meeting {
            if meeting.status != BookingStatus::Refunded {
                self.meetings
                    .update_meeting_status(meeting.id, BookingStatus::Refunded, now)
                    .await?;
            }
        }

        let moved = self
            .sessions
            .transition_session(
                &record.gateway_session_id,
                SettlementState::RefundPending,
                SettlementState::RefundIssued,
                None,
                now,
            )
            .await?;
        if !moved {
            return Ok(());
        }

        match self.reservations.find_reservation(record.reservation_id).await? {
            Some(reservation) => {
                let request = NotificationRequest::new(
                    NotificationKind::BookingRefunded,
                    record.reservation_id,
                    meeting.map(|m| m.id),
                    reservation.client_contact.clone(),
                )
                .with_detail(record.reason.clone());
                self.dispatcher.dispatch(request);
            }
            None => warn!(
                reservation_id = %record.reservation_id,
                "Refund issued for unknown reservation; client not notified"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockPaymentGateway;
    use crate::memory::InMemoryBookingStore;
    use slotbook_core::{ManualClock, Money, PaymentSession, RefundStatus, SlotReservation};
    use slotbook_shared::Masked;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        coordinator: RefundCoordinator,
        store: Arc<InMemoryBookingStore>,
        gateway: Arc<MockPaymentGateway>,
        clock: Arc<ManualClock>,
        rx: UnboundedReceiver<NotificationRequest>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBookingStore::new());
        let gateway = Arc::new(MockPaymentGateway::default());
        let clock = Arc::new(ManualClock::default());
        let (dispatcher, rx) = NotificationDispatcher::channel();
        let coordinator = RefundCoordinator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            gateway.clone(),
            dispatcher,
            clock.clone(),
            RetryPolicy::new(30, 600),
        );
        Fixture { coordinator, store, gateway, clock, rx }
    }

    async fn refund_pending_session(f: &Fixture, session_id: &str) {
        let now = f.clock.now();
        let reservation = SlotReservation::new(
            uuid::Uuid::new_v4(),
            now + Duration::days(1),
            30,
            Masked::from("a@example.com"),
            now,
            600,
        );
        f.store.insert_hold(&reservation, now).await.unwrap();
        let session = PaymentSession::new(session_id.into(), reservation.id, Money::new(5000, "usd"), now);
        f.store.create_session(&session).await.unwrap();
        f.store
            .transition_session(session_id, SettlementState::Initiated, SettlementState::RefundPending, None, now)
            .await
            .unwrap();
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(30, 600);
        assert_eq!(policy.delay_for(1), Duration::seconds(30));
        assert_eq!(policy.delay_for(2), Duration::seconds(60));
        assert_eq!(policy.delay_for(3), Duration::seconds(120));
        assert_eq!(policy.delay_for(10), Duration::seconds(600));
    }

    #[tokio::test]
    async fn test_refund_is_issued_once() {
        let mut f = fixture();
        refund_pending_session(&f, "cs_1").await;

        let first = f.coordinator.issue_refund("cs_1", "slot taken").await.unwrap();
        let second = f.coordinator.issue_refund("cs_1", "slot taken").await.unwrap();

        assert_eq!(first.status, RefundStatus::Issued);
        assert_eq!(first.id, second.id);
        assert_eq!(f.gateway.refund_calls(), 1);

        let session = f.store.find_session("cs_1").await.unwrap().unwrap();
        assert_eq!(session.state, SettlementState::RefundIssued);

        let note = f.rx.try_recv().unwrap();
        assert_eq!(note.event_type, NotificationKind::BookingRefunded);
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_gateway_outage_queues_with_backoff() {
        let f = fixture();
        refund_pending_session(&f, "cs_2").await;
        f.gateway.fail_next_refunds(2);

        let queued = f.coordinator.issue_refund("cs_2", "slot taken").await.unwrap();
        assert_eq!(queued.status, RefundStatus::Pending);
        assert_eq!(queued.attempts, 1);
        assert_eq!(queued.next_attempt_at, f.clock.now() + Duration::seconds(30));
        assert_eq!(f.coordinator.pending_backlog().await.unwrap().len(), 1);

        // not due yet
        assert_eq!(f.coordinator.retry_due(10).await.unwrap().attempted, 0);

        f.clock.advance(Duration::seconds(30));
        let summary = f.coordinator.retry_due(10).await.unwrap();
        assert_eq!(summary, RetrySummary { attempted: 1, issued: 0, still_pending: 1 });
        let record = f.store.find_refund("cs_2").await.unwrap().unwrap();
        assert_eq!(record.next_attempt_at, f.clock.now() + Duration::seconds(60));

        f.clock.advance(Duration::seconds(60));
        let summary = f.coordinator.retry_due(10).await.unwrap();
        assert_eq!(summary.issued, 1);
        assert!(f.coordinator.pending_backlog().await.unwrap().is_empty());
        assert_eq!(f.gateway.refunds_issued(), 1);
    }

    #[tokio::test]
    async fn test_retry_now_skips_backoff() {
        let f = fixture();
        refund_pending_session(&f, "cs_3").await;
        f.gateway.fail_next_refunds(1);

        let queued = f.coordinator.issue_refund("cs_3", "slot taken").await.unwrap();
        assert_eq!(queued.status, RefundStatus::Pending);

        let retried = f.coordinator.retry_now("cs_3").await.unwrap();
        assert_eq!(retried.status, RefundStatus::Issued);
    }

    #[tokio::test]
    async fn test_unknown_session_is_an_error() {
        let f = fixture();
        assert!(matches!(
            f.coordinator.issue_refund("cs_missing", "x").await,
            Err(RefundError::UnknownSession(_))
        ));
        assert!(matches!(
            f.coordinator.retry_now("cs_missing").await,
            Err(RefundError::NotFound(_))
        ));
    }
}
