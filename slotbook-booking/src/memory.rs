use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use slotbook_core::repository::{
    MeetingRepository, PaymentSessionRepository, RefundRepository, ReservationRepository,
};
use slotbook_core::{
    BookingStatus, ConsumeOutcome, HoldOutcome, Meeting, Money, PaymentSession, RefundRecord,
    RefundStatus, ReleaseOutcome, RepositoryError, RepositoryResult, ReservationStatus,
    SettlementState, SlotReservation,
};

#[derive(Default)]
struct BookingState {
    reservations: HashMap<Uuid, SlotReservation>,
    meetings: HashMap<Uuid, Meeting>,
    sessions: HashMap<String, PaymentSession>,
    refunds: HashMap<String, RefundRecord>,
}

/// Single-process implementation of every booking repository.
///
/// One mutex guards all tables, which gives each operation the same atomicity
/// the Postgres store gets from transactions and constraints.
#[derive(Default)]
pub struct InMemoryBookingStore {
    state: Mutex<BookingState>,
    unavailable: AtomicBool,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a storage outage: every call fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn meeting_count(&self) -> usize {
        self.state.lock().map(|s| s.meetings.len()).unwrap_or(0)
    }

    pub fn meetings_for_reservation(&self, reservation_id: Uuid) -> Vec<Meeting> {
        self.state
            .lock()
            .map(|s| {
                s.meetings
                    .values()
                    .filter(|m| m.reservation_id == reservation_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn lock(&self) -> RepositoryResult<MutexGuard<'_, BookingState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepositoryError::Unavailable("in-memory store offline".to_string()));
        }
        self.state
            .lock()
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))
    }
}

#[async_trait]
impl ReservationRepository for InMemoryBookingStore {
    async fn insert_hold(
        &self,
        reservation: &SlotReservation,
        now: DateTime<Utc>,
    ) -> RepositoryResult<HoldOutcome> {
        let mut state = self.lock()?;
        let (start, end) = (reservation.start_time, reservation.end_time());

        let mut conflict = false;
        for existing in state.reservations.values_mut() {
            if !existing.overlaps(reservation.provider_id, start, end) {
                continue;
            }
            if existing.effective_status(now) == ReservationStatus::Expired
                && existing.status == ReservationStatus::Held
            {
                existing.status = ReservationStatus::Expired;
            }
            if existing.status.occupies_slot() {
                conflict = true;
            }
        }

        if conflict {
            return Ok(HoldOutcome::Conflict);
        }

        state.reservations.insert(reservation.id, reservation.clone());
        Ok(HoldOutcome::Held(reservation.clone()))
    }

    async fn find_reservation(&self, id: Uuid) -> RepositoryResult<Option<SlotReservation>> {
        let state = self.lock()?;
        Ok(state.reservations.get(&id).cloned())
    }

    async fn attach_session(&self, id: Uuid, gateway_session_id: &str) -> RepositoryResult<bool> {
        let mut state = self.lock()?;
        match state.reservations.get_mut(&id) {
            Some(r) if r.status == ReservationStatus::Held => {
                r.gateway_session_id = Some(gateway_session_id.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn consume(
        &self,
        id: Uuid,
        gateway_session_id: &str,
        amount: &Money,
        now: DateTime<Utc>,
    ) -> RepositoryResult<ConsumeOutcome> {
        let mut state = self.lock()?;
        let state = &mut *state;

        let reservation = match state.reservations.get_mut(&id) {
            Some(r) => r,
            None => return Ok(ConsumeOutcome::NotFound),
        };

        match reservation.effective_status(now) {
            ReservationStatus::Expired => {
                reservation.status = ReservationStatus::Expired;
                Ok(ConsumeOutcome::Expired)
            }
            ReservationStatus::Cancelled => Ok(ConsumeOutcome::Cancelled),
            ReservationStatus::Consumed => state
                .meetings
                .values()
                .find(|m| m.reservation_id == id)
                .cloned()
                .map(ConsumeOutcome::AlreadyConsumed)
                .ok_or_else(|| {
                    RepositoryError::Corrupt(format!("reservation {} consumed without meeting", id))
                }),
            ReservationStatus::Held => {
                if let Some(attached) = reservation
                    .gateway_session_id
                    .as_ref()
                    .filter(|attached| attached.as_str() != gateway_session_id)
                {
                    return Ok(ConsumeOutcome::SessionMismatch {
                        attached: attached.clone(),
                    });
                }
                reservation.status = ReservationStatus::Consumed;
                reservation.gateway_session_id = Some(gateway_session_id.to_string());

                let meeting = Meeting {
                    id: Uuid::new_v4(),
                    reservation_id: id,
                    provider_id: reservation.provider_id,
                    client_contact: reservation.client_contact.clone(),
                    start_time: reservation.start_time,
                    duration_minutes: reservation.duration_minutes,
                    payment_reference: gateway_session_id.to_string(),
                    amount: amount.clone(),
                    status: BookingStatus::Pending,
                    created_at: now,
                    updated_at: now,
                };
                state.meetings.insert(meeting.id, meeting.clone());
                Ok(ConsumeOutcome::Consumed(meeting))
            }
        }
    }

    async fn release(&self, id: Uuid, now: DateTime<Utc>) -> RepositoryResult<ReleaseOutcome> {
        let mut state = self.lock()?;
        let reservation = match state.reservations.get_mut(&id) {
            Some(r) => r,
            None => return Ok(ReleaseOutcome::NotFound),
        };

        match reservation.effective_status(now) {
            ReservationStatus::Held => {
                reservation.status = ReservationStatus::Cancelled;
                Ok(ReleaseOutcome::Released)
            }
            other => {
                reservation.status = other;
                Ok(ReleaseOutcome::NotHeld(other))
            }
        }
    }
}

#[async_trait]
impl MeetingRepository for InMemoryBookingStore {
    async fn find_meeting(&self, id: Uuid) -> RepositoryResult<Option<Meeting>> {
        let state = self.lock()?;
        Ok(state.meetings.get(&id).cloned())
    }

    async fn find_meeting_by_payment(&self, gateway_session_id: &str) -> RepositoryResult<Option<Meeting>> {
        let state = self.lock()?;
        Ok(state
            .meetings
            .values()
            .find(|m| m.payment_reference == gateway_session_id)
            .cloned())
    }

    async fn update_meeting_status(
        &self,
        id: Uuid,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let mut state = self.lock()?;
        let meeting = state
            .meetings
            .get_mut(&id)
            .ok_or_else(|| RepositoryError::NotFound(format!("meeting {}", id)))?;
        meeting.status = status;
        meeting.updated_at = now;
        Ok(())
    }
}

#[async_trait]
impl PaymentSessionRepository for InMemoryBookingStore {
    async fn create_session(&self, session: &PaymentSession) -> RepositoryResult<bool> {
        let mut state = self.lock()?;
        if state.sessions.contains_key(&session.gateway_session_id) {
            return Ok(false);
        }
        state
            .sessions
            .insert(session.gateway_session_id.clone(), session.clone());
        Ok(true)
    }

    async fn find_session(&self, gateway_session_id: &str) -> RepositoryResult<Option<PaymentSession>> {
        let state = self.lock()?;
        Ok(state.sessions.get(gateway_session_id).cloned())
    }

    async fn transition_session(
        &self,
        gateway_session_id: &str,
        from: SettlementState,
        to: SettlementState,
        continuation: Option<&serde_json::Value>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let mut state = self.lock()?;
        match state.sessions.get_mut(gateway_session_id) {
            Some(session) if session.state == from => {
                session.state = to;
                if let Some(data) = continuation {
                    session.continuation = Some(data.clone());
                }
                session.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl RefundRepository for InMemoryBookingStore {
    async fn find_refund(&self, gateway_session_id: &str) -> RepositoryResult<Option<RefundRecord>> {
        let state = self.lock()?;
        Ok(state.refunds.get(gateway_session_id).cloned())
    }

    async fn insert_refund(&self, record: &RefundRecord) -> RepositoryResult<RefundRecord> {
        let mut state = self.lock()?;
        let stored = state
            .refunds
            .entry(record.gateway_session_id.clone())
            .or_insert_with(|| record.clone());
        Ok(stored.clone())
    }

    async fn claim_refund(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let mut state = self.lock()?;
        match state.refunds.values_mut().find(|r| r.id == id) {
            Some(r) if r.status == RefundStatus::Pending && r.next_attempt_at <= now => {
                r.next_attempt_at = lease_until;
                r.last_error = None;
                r.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expedite_refund(&self, id: Uuid, now: DateTime<Utc>) -> RepositoryResult<bool> {
        let mut state = self.lock()?;
        match state.refunds.values_mut().find(|r| r.id == id) {
            Some(r) if r.status == RefundStatus::Pending && r.last_error.is_some() => {
                r.next_attempt_at = now;
                r.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_refund_issued(
        &self,
        id: Uuid,
        gateway_refund_id: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let mut state = self.lock()?;
        let refund = state
            .refunds
            .values_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("refund {}", id)))?;
        refund.status = RefundStatus::Issued;
        refund.attempts += 1;
        refund.gateway_refund_id = Some(gateway_refund_id.to_string());
        refund.last_error = None;
        refund.updated_at = now;
        Ok(())
    }

    async fn record_refund_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let mut state = self.lock()?;
        let refund = state
            .refunds
            .values_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| RepositoryError::NotFound(format!("refund {}", id)))?;
        refund.attempts += 1;
        refund.last_error = Some(error.to_string());
        refund.next_attempt_at = next_attempt_at;
        refund.updated_at = now;
        Ok(())
    }

    async fn list_pending_refunds(&self) -> RepositoryResult<Vec<RefundRecord>> {
        let state = self.lock()?;
        let mut pending: Vec<RefundRecord> = state
            .refunds
            .values()
            .filter(|r| r.status == RefundStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    async fn list_due_refunds(&self, now: DateTime<Utc>, limit: i64) -> RepositoryResult<Vec<RefundRecord>> {
        let mut due: Vec<RefundRecord> = self
            .list_pending_refunds()
            .await?
            .into_iter()
            .filter(|r| r.next_attempt_at <= now)
            .collect();
        due.sort_by_key(|r| r.next_attempt_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }
}
