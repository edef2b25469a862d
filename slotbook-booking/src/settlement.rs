use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use slotbook_core::repository::{MeetingRepository, PaymentSessionRepository};
use slotbook_core::{
    BookingStatus, CacheOutcome, CacheStore, Clock, ConsumeOutcome, Meeting, Money,
    PaymentSession, RefundRecord, RepositoryError, ReservationStatus, SettlementState,
};
use slotbook_shared::models::events::{NotificationKind, NotificationRequest};

use crate::dispatch::NotificationDispatcher;
use crate::refund::{RefundCoordinator, RefundError};
use crate::reservation::{ReservationError, SlotReservationManager};
use crate::webhook::{
    ActionRequired, GatewayEvent, PaymentFailed, PaymentSucceeded, SignatureError, WebhookEvent,
    WebhookVerifier,
};

const DEDUP_PREFIX: &str = "webhook-dedup";
const MAX_CAS_ATTEMPTS: usize = 3;

/// How a delivered event was handled. Every variant is acknowledged to the gateway.
#[derive(Debug, Clone)]
pub enum SettlementOutcome {
    Confirmed { meeting_id: Uuid },
    AlreadySettled,
    Authorizing,
    Compensated { refund: RefundRecord },
    PaymentFailed,
    Duplicate,
    /// Conflicting or out-of-order event against a sticky state. Logged for review, no mutation.
    Anomaly { reason: String },
    Ignored,
}

impl SettlementOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementOutcome::Confirmed { .. } => "confirmed",
            SettlementOutcome::AlreadySettled => "already_settled",
            SettlementOutcome::Authorizing => "authorizing",
            SettlementOutcome::Compensated { .. } => "compensated",
            SettlementOutcome::PaymentFailed => "payment_failed",
            SettlementOutcome::Duplicate => "duplicate",
            SettlementOutcome::Anomaly { .. } => "anomaly",
            SettlementOutcome::Ignored => "ignored",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettlementError {
    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(SignatureError),

    #[error("Malformed webhook event: {0}")]
    Malformed(String),

    #[error(transparent)]
    Storage(#[from] RepositoryError),

    #[error(transparent)]
    Refund(#[from] RefundError),

    #[error(transparent)]
    Reservation(#[from] ReservationError),
}

impl SettlementError {
    /// Protocol errors are rejected for good; everything else is worth a gateway redelivery.
    pub fn is_client_error(&self) -> bool {
        matches!(self, SettlementError::InvalidSignature(_) | SettlementError::Malformed(_))
    }
}

enum Advance {
    Moved,
    Stale(SettlementState),
}

/// Drives each gateway session through the settlement lattice from webhook deliveries.
pub struct SettlementEngine {
    verifier: WebhookVerifier,
    reservations: Arc<SlotReservationManager>,
    meetings: Arc<dyn MeetingRepository>,
    sessions: Arc<dyn PaymentSessionRepository>,
    refunds: Arc<RefundCoordinator>,
    dedup: Arc<dyn CacheStore>,
    dispatcher: NotificationDispatcher,
    clock: Arc<dyn Clock>,
    dedup_ttl: Duration,
}

impl SettlementEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        verifier: WebhookVerifier,
        reservations: Arc<SlotReservationManager>,
        meetings: Arc<dyn MeetingRepository>,
        sessions: Arc<dyn PaymentSessionRepository>,
        refunds: Arc<RefundCoordinator>,
        dedup: Arc<dyn CacheStore>,
        dispatcher: NotificationDispatcher,
        clock: Arc<dyn Clock>,
        dedup_ttl: Duration,
    ) -> Self {
        Self {
            verifier,
            reservations,
            meetings,
            sessions,
            refunds,
            dedup,
            dispatcher,
            clock,
            dedup_ttl,
        }
    }

    /// Entry point for raw deliveries: signature, envelope, then [`Self::process_event`].
    pub async fn handle_webhook_event(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> Result<SettlementOutcome, SettlementError> {
        let now = self.clock.now();
        if let Err(e) = self.verifier.verify(payload, signature, now) {
            warn!("Rejected webhook delivery: {}", e);
            return Err(SettlementError::InvalidSignature(e));
        }

        let event = WebhookEvent::from_json(payload, now).map_err(|e| {
            warn!("Rejected webhook delivery: {}", e);
            SettlementError::Malformed(e.0)
        })?;

        self.process_event(&event).await
    }

    /// At most one business effect per event id. The dedup marker is written only
    /// after the event was fully handled, so a failed attempt is redone on redelivery.
    pub async fn process_event(&self, event: &WebhookEvent) -> Result<SettlementOutcome, SettlementError> {
        let dedup_key = format!("{}:{}", DEDUP_PREFIX, event.event_id);

        match self.dedup.exists(&dedup_key).await {
            CacheOutcome::Fresh(true) | CacheOutcome::Degraded(true) => {
                info!(event_id = %event.event_id, "Duplicate webhook delivery acknowledged");
                return Ok(SettlementOutcome::Duplicate);
            }
            CacheOutcome::Unavailable => {
                warn!(event_id = %event.event_id, "Dedup store unavailable, relying on session state");
            }
            _ => {}
        }

        let parsed = GatewayEvent::parse(event).map_err(|e| {
            warn!(event_id = %event.event_id, event_type = %event.event_type, "{}", e);
            SettlementError::Malformed(e.0)
        })?;

        let outcome = match parsed {
            GatewayEvent::RequiresAction(action) => self.on_requires_action(action).await?,
            GatewayEvent::Succeeded(paid) => self.on_succeeded(paid).await?,
            GatewayEvent::Failed(failed) => self.on_failed(failed).await?,
            GatewayEvent::Unhandled(event_type) => {
                debug!(event_id = %event.event_id, event_type = %event_type, "Ignoring webhook type");
                SettlementOutcome::Ignored
            }
        };

        if let CacheOutcome::Unavailable = self.dedup.set(&dedup_key, "1", Some(self.dedup_ttl)).await {
            warn!(event_id = %event.event_id, "Could not record webhook dedup marker");
        }

        info!(event_id = %event.event_id, event_type = %event.event_type, outcome = ?outcome, "Webhook handled");
        Ok(outcome)
    }

    async fn on_requires_action(&self, action: ActionRequired) -> Result<SettlementOutcome, SettlementError> {
        let Some(session) = self
            .load_session(&action.session_id, action.reservation_id, action.amount.as_ref())
            .await?
        else {
            return Ok(self.untracked(&action.session_id));
        };

        if session.state == SettlementState::Authorizing {
            // newer continuation data replaces the old one
            if action.continuation.is_some() {
                self.sessions
                    .transition_session(
                        &action.session_id,
                        SettlementState::Authorizing,
                        SettlementState::Authorizing,
                        action.continuation.as_ref(),
                        self.clock.now(),
                    )
                    .await?;
            }
            return Ok(SettlementOutcome::Authorizing);
        }

        match self
            .advance(&action.session_id, SettlementState::Authorizing, action.continuation.as_ref())
            .await?
        {
            Advance::Moved => {
                info!(session_id = %action.session_id, "Payment requires action");
                Ok(SettlementOutcome::Authorizing)
            }
            Advance::Stale(state) => {
                info!(
                    session_id = %action.session_id,
                    state = state.as_str(),
                    "Late requires-action event ignored"
                );
                Ok(SettlementOutcome::Ignored)
            }
        }
    }

    async fn on_succeeded(&self, paid: PaymentSucceeded) -> Result<SettlementOutcome, SettlementError> {
        let Some(session) = self
            .load_session(&paid.session_id, paid.reservation_id, Some(&paid.amount))
            .await?
        else {
            return Ok(self.untracked(&paid.session_id));
        };

        if session.reservation_id != paid.reservation_id {
            return Ok(self.anomaly(
                &paid.session_id,
                format!(
                    "event names reservation {} but session pays for {}",
                    paid.reservation_id, session.reservation_id
                ),
            ));
        }

        match session.state {
            SettlementState::Initiated | SettlementState::Authorizing | SettlementState::Succeeded => {}
            other => return self.already_past(&paid.session_id, other).await,
        }

        match self.advance(&paid.session_id, SettlementState::Succeeded, None).await? {
            Advance::Moved | Advance::Stale(SettlementState::Succeeded) => {}
            Advance::Stale(other) => return self.already_past(&paid.session_id, other).await,
        }

        let consumed = self
            .reservations
            .consume(paid.reservation_id, &paid.session_id, &paid.amount)
            .await?;

        match consumed {
            ConsumeOutcome::Consumed(meeting) => self.confirm(&paid.session_id, meeting).await,
            ConsumeOutcome::AlreadyConsumed(meeting) if meeting.paid_by(&paid.session_id) => {
                if meeting.status == BookingStatus::Pending {
                    self.confirm(&paid.session_id, meeting).await
                } else {
                    Ok(SettlementOutcome::AlreadySettled)
                }
            }
            ConsumeOutcome::AlreadyConsumed(_) => {
                self.compensate(&paid.session_id, "slot was booked by another client").await
            }
            // the hold is still waiting on its own session, which may be this same payment
            ConsumeOutcome::SessionMismatch { attached } => Ok(self.anomaly(
                &paid.session_id,
                format!(
                    "reservation {} is held for session {}",
                    paid.reservation_id, attached
                ),
            )),
            ConsumeOutcome::Expired => {
                self.compensate(&paid.session_id, "reservation expired before payment completed")
                    .await
            }
            ConsumeOutcome::Cancelled => {
                self.compensate(&paid.session_id, "reservation was cancelled before payment completed")
                    .await
            }
            ConsumeOutcome::NotFound => {
                self.compensate(&paid.session_id, "payment references an unknown reservation")
                    .await
            }
        }
    }

    async fn on_failed(&self, failed: PaymentFailed) -> Result<SettlementOutcome, SettlementError> {
        if self
            .load_session(&failed.session_id, failed.reservation_id, failed.amount.as_ref())
            .await?
            .is_none()
        {
            return Ok(self.untracked(&failed.session_id));
        }

        let moved = match self.advance(&failed.session_id, SettlementState::Failed, None).await? {
            Advance::Moved => true,
            Advance::Stale(SettlementState::Failed) => false,
            Advance::Stale(other) => {
                return Ok(self.anomaly(
                    &failed.session_id,
                    format!("failure event after session reached {}", other.as_str()),
                ))
            }
        };

        // only the hold this session paid for, and only while it is still held
        if let Some(reservation) = self.reservations.get(failed.reservation_id).await? {
            let ours = reservation
                .gateway_session_id
                .as_deref()
                .map_or(true, |id| id == failed.session_id);
            if reservation.status == ReservationStatus::Held && ours {
                self.reservations.release(failed.reservation_id).await?;
            }
        }

        if let Some(meeting) = self.meetings.find_meeting_by_payment(&failed.session_id).await? {
            if meeting.status != BookingStatus::Failed {
                self.meetings
                    .update_meeting_status(meeting.id, BookingStatus::Failed, self.clock.now())
                    .await?;
                let mut request = NotificationRequest::new(
                    NotificationKind::BookingFailed,
                    meeting.reservation_id,
                    Some(meeting.id),
                    meeting.client_contact.clone(),
                );
                if let Some(reason) = &failed.reason {
                    request = request.with_detail(reason.clone());
                }
                self.dispatcher.dispatch(request);
            }
        }

        info!(
            session_id = %failed.session_id,
            reason = failed.reason.as_deref().unwrap_or("unspecified"),
            "Payment failed"
        );
        Ok(if moved {
            SettlementOutcome::PaymentFailed
        } else {
            SettlementOutcome::AlreadySettled
        })
    }

    async fn confirm(&self, session_id: &str, meeting: Meeting) -> Result<SettlementOutcome, SettlementError> {
        self.meetings
            .update_meeting_status(meeting.id, BookingStatus::Confirmed, self.clock.now())
            .await?;

        match self.advance(session_id, SettlementState::Confirmed, None).await? {
            Advance::Moved => {
                info!(session_id = %session_id, meeting_id = %meeting.id, "Booking confirmed");
                self.dispatcher.dispatch(NotificationRequest::new(
                    NotificationKind::BookingConfirmed,
                    meeting.reservation_id,
                    Some(meeting.id),
                    meeting.client_contact.clone(),
                ));
                Ok(SettlementOutcome::Confirmed { meeting_id: meeting.id })
            }
            Advance::Stale(SettlementState::Confirmed) => Ok(SettlementOutcome::AlreadySettled),
            Advance::Stale(other) => Ok(self.anomaly(
                session_id,
                format!("meeting {} consumed but session is {}", meeting.id, other.as_str()),
            )),
        }
    }

    async fn compensate(&self, session_id: &str, reason: &str) -> Result<SettlementOutcome, SettlementError> {
        match self.advance(session_id, SettlementState::RefundPending, None).await? {
            Advance::Moved | Advance::Stale(SettlementState::RefundPending) => {}
            Advance::Stale(SettlementState::RefundIssued) => return Ok(SettlementOutcome::AlreadySettled),
            Advance::Stale(other) => {
                return Ok(self.anomaly(
                    session_id,
                    format!("cannot compensate session in {}", other.as_str()),
                ))
            }
        }

        warn!(session_id = %session_id, reason = %reason, "Payment captured for a lost slot, refunding");
        let refund = self.refunds.issue_refund(session_id, reason).await?;
        Ok(SettlementOutcome::Compensated { refund })
    }

    /// A success event for a session that has already left the pre-settlement states.
    async fn already_past(
        &self,
        session_id: &str,
        state: SettlementState,
    ) -> Result<SettlementOutcome, SettlementError> {
        match state {
            SettlementState::Confirmed | SettlementState::RefundIssued => {
                info!(session_id = %session_id, state = state.as_str(), "Session already settled");
                Ok(SettlementOutcome::AlreadySettled)
            }
            SettlementState::RefundPending => {
                let refund = self
                    .refunds
                    .issue_refund(session_id, "retrying pending compensation")
                    .await?;
                Ok(SettlementOutcome::Compensated { refund })
            }
            other => Ok(self.anomaly(
                session_id,
                format!("success event after session reached {}", other.as_str()),
            )),
        }
    }

    fn anomaly(&self, session_id: &str, reason: String) -> SettlementOutcome {
        error!(session_id = %session_id, anomaly = true, "Settlement anomaly: {}", reason);
        SettlementOutcome::Anomaly { reason }
    }

    fn untracked(&self, session_id: &str) -> SettlementOutcome {
        self.anomaly(
            session_id,
            "event for an unknown session carries no amount to track it by".to_string(),
        )
    }

    /// The session the event refers to. Sessions normally exist from checkout; one
    /// created elsewhere is tracked from the first event that states what was charged.
    async fn load_session(
        &self,
        session_id: &str,
        reservation_id: Uuid,
        amount: Option<&Money>,
    ) -> Result<Option<PaymentSession>, SettlementError> {
        if let Some(session) = self.sessions.find_session(session_id).await? {
            return Ok(Some(session));
        }
        let Some(amount) = amount else {
            return Ok(None);
        };

        let session = PaymentSession::new(
            session_id.to_string(),
            reservation_id,
            amount.clone(),
            self.clock.now(),
        );
        if self.sessions.create_session(&session).await? {
            warn!(session_id = %session_id, reservation_id = %reservation_id, "Tracking unknown payment session from webhook");
            return Ok(Some(session));
        }

        self.sessions
            .find_session(session_id)
            .await?
            .map(Some)
            .ok_or_else(|| RepositoryError::NotFound(format!("payment session {}", session_id)).into())
    }

    /// Compare-and-set the session forward. Gives up with the current state when
    /// the lattice does not allow the move.
    async fn advance(
        &self,
        session_id: &str,
        to: SettlementState,
        continuation: Option<&Value>,
    ) -> Result<Advance, SettlementError> {
        let mut current = SettlementState::Initiated;
        for _ in 0..MAX_CAS_ATTEMPTS {
            current = self
                .sessions
                .find_session(session_id)
                .await?
                .ok_or_else(|| RepositoryError::NotFound(format!("payment session {}", session_id)))?
                .state;

            if !current.can_advance_to(to) {
                return Ok(Advance::Stale(current));
            }

            if self
                .sessions
                .transition_session(session_id, current, to, continuation, self.clock.now())
                .await?
            {
                debug!(session_id = %session_id, from = current.as_str(), to = to.as_str(), "Session advanced");
                return Ok(Advance::Moved);
            }
        }
        Ok(Advance::Stale(current))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MockPaymentGateway;
    use crate::memory::InMemoryBookingStore;
    use crate::refund::RetryPolicy;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;
    use slotbook_core::{InMemoryCache, ManualClock, RefundStatus, SlotReservation};
    use slotbook_shared::Masked;
    use tokio::sync::mpsc::UnboundedReceiver;

    const SECRET: &str = "whsec_test";

    struct Fixture {
        engine: SettlementEngine,
        manager: Arc<SlotReservationManager>,
        store: Arc<InMemoryBookingStore>,
        gateway: Arc<MockPaymentGateway>,
        clock: Arc<ManualClock>,
        rx: UnboundedReceiver<NotificationRequest>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryBookingStore::new());
        let gateway = Arc::new(MockPaymentGateway::default());
        let clock = Arc::new(ManualClock::default());
        let cache = Arc::new(InMemoryCache::with_clock(clock.clone()));
        let (dispatcher, rx) = NotificationDispatcher::channel();

        let manager = Arc::new(SlotReservationManager::new(store.clone(), clock.clone()));
        let refunds = Arc::new(RefundCoordinator::new(
            store.clone(),
            store.clone(),
            store.clone(),
            store.clone(),
            gateway.clone(),
            dispatcher.clone(),
            clock.clone(),
            RetryPolicy::default(),
        ));
        let engine = SettlementEngine::new(
            WebhookVerifier::new(SECRET, 300),
            manager.clone(),
            store.clone(),
            store.clone(),
            refunds,
            cache,
            dispatcher,
            clock.clone(),
            Duration::from_secs(86_400),
        );

        Fixture { engine, manager, store, gateway, clock, rx }
    }

    fn price() -> Money {
        Money::new(5000, "usd")
    }

    /// Hold a slot and open a checkout session for it, as checkout would.
    async fn checkout_at(
        f: &Fixture,
        provider: Uuid,
        start: chrono::DateTime<chrono::Utc>,
        contact: &str,
        session_id: &str,
    ) -> SlotReservation {
        let reservation = f
            .manager
            .hold(provider, start, 30, Masked::from(contact), 600)
            .await
            .unwrap();
        f.manager.attach_session(reservation.id, session_id).await.unwrap();
        let session = PaymentSession::new(session_id.into(), reservation.id, price(), f.clock.now());
        f.store.create_session(&session).await.unwrap();
        reservation
    }

    async fn checkout(f: &Fixture, provider: Uuid, contact: &str, session_id: &str) -> SlotReservation {
        let start = f.clock.now() + ChronoDuration::days(3);
        checkout_at(f, provider, start, contact, session_id).await
    }

    fn body(event_id: &str, event_type: &str, session_id: &str, reservation_id: Uuid) -> Vec<u8> {
        json!({
            "id": event_id,
            "type": event_type,
            "data": {
                "object": {
                    "id": session_id,
                    "metadata": {
                        "reservation_id": reservation_id.to_string(),
                        "checkout_session_id": session_id
                    },
                    "amount_total": 5000,
                    "currency": "usd",
                    "payment_status": "paid",
                    "next_action": { "display_reference": "VOUCHER-123" }
                }
            }
        })
        .to_string()
        .into_bytes()
    }

    async fn deliver(f: &Fixture, payload: &[u8]) -> Result<SettlementOutcome, SettlementError> {
        let signature = WebhookVerifier::new(SECRET, 300).sign(payload, f.clock.now().timestamp());
        f.engine.handle_webhook_event(payload, &signature).await
    }

    async fn state_of(f: &Fixture, session_id: &str) -> SettlementState {
        f.store.find_session(session_id).await.unwrap().unwrap().state
    }

    #[tokio::test]
    async fn test_duplicate_delivery_has_one_effect() {
        let mut f = fixture();
        let r = checkout(&f, Uuid::new_v4(), "a@example.com", "cs_a").await;
        let payload = body("evt_1", "checkout.session.completed", "cs_a", r.id);

        let first = deliver(&f, &payload).await.unwrap();
        let second = deliver(&f, &payload).await.unwrap();

        assert!(matches!(first, SettlementOutcome::Confirmed { .. }));
        assert!(matches!(second, SettlementOutcome::Duplicate));
        assert_eq!(state_of(&f, "cs_a").await, SettlementState::Confirmed);
        assert_eq!(f.store.meeting_count(), 1);

        let note = f.rx.try_recv().unwrap();
        assert_eq!(note.event_type, NotificationKind::BookingConfirmed);
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_second_success_event_for_session_is_settled() {
        let mut f = fixture();
        let r = checkout(&f, Uuid::new_v4(), "a@example.com", "cs_a").await;

        deliver(&f, &body("evt_1", "checkout.session.completed", "cs_a", r.id)).await.unwrap();
        let again = deliver(&f, &body("evt_2", "payment_intent.succeeded", "cs_a", r.id))
            .await
            .unwrap();

        assert!(matches!(again, SettlementOutcome::AlreadySettled));
        assert!(f.rx.try_recv().is_ok());
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_payment_for_expired_and_reheld_slot_is_refunded() {
        let mut f = fixture();
        let provider = Uuid::new_v4();
        let start = f.clock.now() + ChronoDuration::days(3);

        let r1 = checkout_at(&f, provider, start, "a@example.com", "cs_a").await;
        assert!(matches!(
            f.manager.hold(provider, start, 30, Masked::from("b@example.com"), 600).await,
            Err(ReservationError::Conflict)
        ));

        f.clock.advance(ChronoDuration::seconds(601));
        let r2 = checkout_at(&f, provider, start, "b@example.com", "cs_b").await;
        assert_ne!(r1.id, r2.id);

        let late = deliver(&f, &body("evt_a", "checkout.session.completed", "cs_a", r1.id))
            .await
            .unwrap();
        match late {
            SettlementOutcome::Compensated { refund } => assert_eq!(refund.status, RefundStatus::Issued),
            other => panic!("expected compensation, got {:?}", other),
        }
        assert_eq!(state_of(&f, "cs_a").await, SettlementState::RefundIssued);
        assert!(f.store.meetings_for_reservation(r1.id).is_empty());
        assert_eq!(f.gateway.refunds_issued(), 1);

        let refunded = f.rx.try_recv().unwrap();
        assert_eq!(refunded.event_type, NotificationKind::BookingRefunded);
        assert_eq!(refunded.client_contact.expose(), "a@example.com");

        // a later event for the refunded session moves nothing
        let replay = deliver(&f, &body("evt_a2", "payment_intent.succeeded", "cs_a", r1.id))
            .await
            .unwrap();
        assert!(matches!(replay, SettlementOutcome::AlreadySettled));
        assert_eq!(f.gateway.refund_calls(), 1);

        let b = deliver(&f, &body("evt_b", "checkout.session.completed", "cs_b", r2.id))
            .await
            .unwrap();
        assert!(matches!(b, SettlementOutcome::Confirmed { .. }));
        assert_eq!(f.store.meetings_for_reservation(r2.id).len(), 1);
        assert_eq!(f.rx.try_recv().unwrap().event_type, NotificationKind::BookingConfirmed);
    }

    #[tokio::test]
    async fn test_failed_payment_releases_hold_and_is_sticky() {
        let f = fixture();
        let provider = Uuid::new_v4();
        let r = checkout(&f, provider, "a@example.com", "cs_a").await;

        let failed = deliver(&f, &body("evt_1", "payment_intent.payment_failed", "cs_a", r.id))
            .await
            .unwrap();
        assert!(matches!(failed, SettlementOutcome::PaymentFailed));
        assert_eq!(
            f.manager.get(r.id).await.unwrap().unwrap().status,
            ReservationStatus::Cancelled
        );

        let late = deliver(&f, &body("evt_2", "checkout.session.completed", "cs_a", r.id))
            .await
            .unwrap();
        assert!(matches!(late, SettlementOutcome::Anomaly { .. }));
        assert_eq!(state_of(&f, "cs_a").await, SettlementState::Failed);
        assert_eq!(f.store.meeting_count(), 0);

        assert!(f
            .manager
            .hold(provider, r.start_time, 30, Masked::from("b@example.com"), 600)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_failure_after_confirmation_is_an_anomaly() {
        let f = fixture();
        let r = checkout(&f, Uuid::new_v4(), "a@example.com", "cs_a").await;
        deliver(&f, &body("evt_1", "checkout.session.completed", "cs_a", r.id)).await.unwrap();

        let late = deliver(&f, &body("evt_2", "payment_intent.canceled", "cs_a", r.id))
            .await
            .unwrap();
        assert!(matches!(late, SettlementOutcome::Anomaly { .. }));
        assert_eq!(state_of(&f, "cs_a").await, SettlementState::Confirmed);
    }

    #[tokio::test]
    async fn test_requires_action_keeps_the_hold() {
        let f = fixture();
        let r = checkout(&f, Uuid::new_v4(), "a@example.com", "cs_a").await;

        let outcome = deliver(&f, &body("evt_1", "payment_intent.requires_action", "cs_a", r.id))
            .await
            .unwrap();
        assert!(matches!(outcome, SettlementOutcome::Authorizing));

        let session = f.store.find_session("cs_a").await.unwrap().unwrap();
        assert_eq!(session.state, SettlementState::Authorizing);
        assert_eq!(
            session.continuation,
            Some(json!({ "display_reference": "VOUCHER-123" }))
        );
        assert_eq!(
            f.manager.get(r.id).await.unwrap().unwrap().status,
            ReservationStatus::Held
        );
    }

    #[tokio::test]
    async fn test_bad_signature_and_malformed_body_are_rejected() {
        let f = fixture();
        let payload = body("evt_1", "checkout.session.completed", "cs_a", Uuid::new_v4());

        let forged = WebhookVerifier::new("other", 300).sign(&payload, f.clock.now().timestamp());
        let err = f.engine.handle_webhook_event(&payload, &forged).await.unwrap_err();
        assert!(matches!(err, SettlementError::InvalidSignature(SignatureError::Mismatch)));
        assert!(err.is_client_error());

        let err = deliver(&f, b"not json").await.unwrap_err();
        assert!(matches!(err, SettlementError::Malformed(_)));

        let missing_reservation = json!({
            "id": "evt_2",
            "type": "checkout.session.completed",
            "data": { "object": { "id": "cs_a", "amount_total": 5000, "currency": "usd" } }
        })
        .to_string();
        let err = deliver(&f, missing_reservation.as_bytes()).await.unwrap_err();
        assert!(err.is_client_error());
    }

    #[tokio::test]
    async fn test_storage_outage_is_reprocessed_on_redelivery() {
        let f = fixture();
        let r = checkout(&f, Uuid::new_v4(), "a@example.com", "cs_a").await;
        let payload = body("evt_1", "checkout.session.completed", "cs_a", r.id);

        f.store.set_unavailable(true);
        let err = deliver(&f, &payload).await.unwrap_err();
        assert!(matches!(err, SettlementError::Storage(_)));
        assert!(!err.is_client_error());

        f.store.set_unavailable(false);
        let retried = deliver(&f, &payload).await.unwrap();
        assert!(matches!(retried, SettlementOutcome::Confirmed { .. }));
    }

    #[tokio::test]
    async fn test_intent_and_session_events_for_one_payment_confirm_once() {
        let mut f = fixture();
        let r = checkout(&f, Uuid::new_v4(), "a@example.com", "cs_a").await;

        let intent = json!({
            "id": "evt_pi",
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": "pi_a",
                    "amount_received": 5000,
                    "currency": "usd",
                    "metadata": {
                        "reservation_id": r.id.to_string(),
                        "checkout_session_id": "cs_a"
                    }
                }
            }
        })
        .to_string()
        .into_bytes();

        let first = deliver(&f, &intent).await.unwrap();
        let second = deliver(&f, &body("evt_cs", "checkout.session.completed", "cs_a", r.id))
            .await
            .unwrap();

        assert!(matches!(first, SettlementOutcome::Confirmed { .. }));
        assert!(matches!(second, SettlementOutcome::AlreadySettled));
        assert_eq!(f.store.meeting_count(), 1);
        assert!(f.store.meetings_for_reservation(r.id)[0].paid_by("cs_a"));
        assert_eq!(f.gateway.refund_calls(), 0);
        assert_eq!(f.rx.try_recv().unwrap().event_type, NotificationKind::BookingConfirmed);
        assert!(f.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unlinked_intent_does_not_settle_the_slot() {
        let f = fixture();
        let r = checkout(&f, Uuid::new_v4(), "a@example.com", "cs_a").await;

        let intent = json!({
            "id": "evt_pi",
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": "pi_a",
                    "amount_received": 5000,
                    "currency": "usd",
                    "metadata": { "reservation_id": r.id.to_string() }
                }
            }
        })
        .to_string()
        .into_bytes();

        assert!(matches!(deliver(&f, &intent).await.unwrap(), SettlementOutcome::Ignored));
        assert!(f.store.find_session("pi_a").await.unwrap().is_none());
        assert_eq!(
            f.manager.get(r.id).await.unwrap().unwrap().status,
            ReservationStatus::Held
        );
    }

    #[tokio::test]
    async fn test_foreign_session_cannot_consume_an_attached_hold() {
        let f = fixture();
        let r = checkout(&f, Uuid::new_v4(), "a@example.com", "cs_a").await;

        let stray = deliver(&f, &body("evt_x", "checkout.session.completed", "cs_x", r.id))
            .await
            .unwrap();
        assert!(matches!(stray, SettlementOutcome::Anomaly { .. }));
        assert_eq!(f.store.meeting_count(), 0);
        assert_eq!(f.gateway.refund_calls(), 0);

        let own = deliver(&f, &body("evt_a", "checkout.session.completed", "cs_a", r.id))
            .await
            .unwrap();
        assert!(matches!(own, SettlementOutcome::Confirmed { .. }));
        assert!(f.store.meetings_for_reservation(r.id)[0].paid_by("cs_a"));
    }

    #[tokio::test]
    async fn test_unknown_session_without_amount_is_not_tracked() {
        let f = fixture();
        let r = checkout(&f, Uuid::new_v4(), "a@example.com", "cs_a").await;

        let failed = json!({
            "id": "evt_1",
            "type": "checkout.session.expired",
            "data": {
                "object": {
                    "id": "cs_unknown",
                    "metadata": { "reservation_id": r.id.to_string() }
                }
            }
        })
        .to_string()
        .into_bytes();

        let outcome = deliver(&f, &failed).await.unwrap();
        assert!(matches!(outcome, SettlementOutcome::Anomaly { .. }));
        assert!(f.store.find_session("cs_unknown").await.unwrap().is_none());
        assert_eq!(
            f.manager.get(r.id).await.unwrap().unwrap().status,
            ReservationStatus::Held
        );
    }

    #[tokio::test]
    async fn test_unhandled_event_type_is_acknowledged() {
        let f = fixture();
        let outcome = deliver(&f, &body("evt_1", "customer.created", "cus_1", Uuid::new_v4()))
            .await
            .unwrap();
        assert!(matches!(outcome, SettlementOutcome::Ignored));
    }
}
