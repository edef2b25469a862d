use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use slotbook_core::repository::ReservationRepository;
use slotbook_core::{
    Clock, ConsumeOutcome, HoldOutcome, Money, ReleaseOutcome, RepositoryError, SlotReservation,
};
use slotbook_shared::Masked;

/// Owns every reservation state change. Exclusivity is decided by the durable
/// repository alone; the distributed cache is never consulted here, so cache
/// degradation cannot weaken it.
pub struct SlotReservationManager {
    repo: Arc<dyn ReservationRepository>,
    clock: Arc<dyn Clock>,
}

impl SlotReservationManager {
    pub fn new(repo: Arc<dyn ReservationRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { repo, clock }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Claim `(provider, [start, start + duration))` for `ttl_seconds`.
    pub async fn hold(
        &self,
        provider_id: Uuid,
        start_time: DateTime<Utc>,
        duration_minutes: i32,
        client_contact: Masked<String>,
        ttl_seconds: u64,
    ) -> Result<SlotReservation, ReservationError> {
        if duration_minutes <= 0 {
            return Err(ReservationError::InvalidRequest(
                "duration_minutes must be positive".to_string(),
            ));
        }
        if ttl_seconds == 0 {
            return Err(ReservationError::InvalidRequest(
                "ttl_seconds must be positive".to_string(),
            ));
        }
        if client_contact.expose().trim().is_empty() {
            return Err(ReservationError::InvalidRequest(
                "client_contact is required".to_string(),
            ));
        }

        let now = self.clock.now();
        let reservation = SlotReservation::new(
            provider_id,
            start_time,
            duration_minutes,
            client_contact,
            now,
            ttl_seconds,
        );

        match self.repo.insert_hold(&reservation, now).await? {
            HoldOutcome::Held(held) => {
                info!(
                    reservation_id = %held.id,
                    provider_id = %provider_id,
                    expires_at = %held.expires_at,
                    "Slot held"
                );
                Ok(held)
            }
            HoldOutcome::Conflict => {
                info!(provider_id = %provider_id, start_time = %start_time, "Slot hold rejected: conflict");
                Err(ReservationError::Conflict)
            }
        }
    }

    /// Reservation as of now, with lazy expiry applied.
    pub async fn get(&self, reservation_id: Uuid) -> Result<Option<SlotReservation>, ReservationError> {
        let now = self.clock.now();
        Ok(self
            .repo
            .find_reservation(reservation_id)
            .await?
            .map(|r| r.observed_at(now)))
    }

    pub async fn attach_session(
        &self,
        reservation_id: Uuid,
        gateway_session_id: &str,
    ) -> Result<(), ReservationError> {
        if self.repo.attach_session(reservation_id, gateway_session_id).await? {
            Ok(())
        } else {
            warn!(reservation_id = %reservation_id, "Cannot attach payment session: reservation not held");
            Err(ReservationError::NotHeld(reservation_id))
        }
    }

    /// HELD → CONSUMED and create the meeting, atomically. Repeating the call
    /// for an already consumed reservation returns the existing meeting.
    pub async fn consume(
        &self,
        reservation_id: Uuid,
        gateway_session_id: &str,
        amount: &Money,
    ) -> Result<ConsumeOutcome, ReservationError> {
        let now = self.clock.now();
        let outcome = self
            .repo
            .consume(reservation_id, gateway_session_id, amount, now)
            .await?;

        match &outcome {
            ConsumeOutcome::Consumed(meeting) => {
                info!(reservation_id = %reservation_id, meeting_id = %meeting.id, "Reservation consumed");
            }
            ConsumeOutcome::AlreadyConsumed(meeting) => {
                info!(
                    reservation_id = %reservation_id,
                    meeting_id = %meeting.id,
                    same_payer = meeting.paid_by(gateway_session_id),
                    "Reservation already consumed"
                );
            }
            ConsumeOutcome::SessionMismatch { attached } => {
                warn!(
                    reservation_id = %reservation_id,
                    attached = %attached,
                    offered = %gateway_session_id,
                    "Consume rejected: reservation belongs to another session"
                );
            }
            ConsumeOutcome::Expired => {
                warn!(reservation_id = %reservation_id, "Consume rejected: reservation expired");
            }
            ConsumeOutcome::Cancelled => {
                warn!(reservation_id = %reservation_id, "Consume rejected: reservation cancelled");
            }
            ConsumeOutcome::NotFound => {
                warn!(reservation_id = %reservation_id, "Consume rejected: reservation not found");
            }
        }

        Ok(outcome)
    }

    /// Explicit cancellation when a client abandons checkout.
    pub async fn release(&self, reservation_id: Uuid) -> Result<ReleaseOutcome, ReservationError> {
        let now = self.clock.now();
        let outcome = self.repo.release(reservation_id, now).await?;
        if outcome == ReleaseOutcome::Released {
            info!(reservation_id = %reservation_id, "Reservation released");
        }
        Ok(outcome)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("Slot is already held")]
    Conflict,

    #[error("Reservation {0} is not held")]
    NotHeld(Uuid),

    #[error("Invalid reservation request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Storage(#[from] RepositoryError),
}
