use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Duration, Utc};
use std::str::FromStr;

use slotbook_shared::Masked;
use crate::booking::Meeting;
use crate::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Held,
    Consumed,
    Expired,
    Cancelled,
}

impl ReservationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Held => "HELD",
            ReservationStatus::Consumed => "CONSUMED",
            ReservationStatus::Expired => "EXPIRED",
            ReservationStatus::Cancelled => "CANCELLED",
        }
    }

    /// HELD and CONSUMED reservations occupy their slot.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, ReservationStatus::Held | ReservationStatus::Consumed)
    }
}

impl FromStr for ReservationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HELD" => Ok(ReservationStatus::Held),
            "CONSUMED" => Ok(ReservationStatus::Consumed),
            "EXPIRED" => Ok(ReservationStatus::Expired),
            "CANCELLED" => Ok(ReservationStatus::Cancelled),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// A short-lived exclusive claim on a provider's time slot while payment is in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotReservation {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub client_contact: Masked<String>,
    pub expires_at: DateTime<Utc>,
    pub gateway_session_id: Option<String>,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
}

impl SlotReservation {
    pub fn new(
        provider_id: Uuid,
        start_time: DateTime<Utc>,
        duration_minutes: i32,
        client_contact: Masked<String>,
        now: DateTime<Utc>,
        ttl_seconds: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            provider_id,
            start_time,
            duration_minutes,
            client_contact,
            expires_at: now + Duration::seconds(ttl_seconds as i64),
            gateway_session_id: None,
            status: ReservationStatus::Held,
            created_at: now,
        }
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.start_time + Duration::minutes(self.duration_minutes as i64)
    }

    /// A HELD reservation past its deadline is expired, whatever the stored row says.
    pub fn effective_status(&self, now: DateTime<Utc>) -> ReservationStatus {
        if self.status == ReservationStatus::Held && self.expires_at <= now {
            ReservationStatus::Expired
        } else {
            self.status
        }
    }

    /// Half-open interval overlap on the same provider.
    pub fn overlaps(&self, provider_id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.provider_id == provider_id && self.start_time < end && start < self.end_time()
    }

    /// Returns a copy with lazy expiry applied.
    pub fn observed_at(mut self, now: DateTime<Utc>) -> Self {
        self.status = self.effective_status(now);
        self
    }
}

#[derive(Debug, Clone)]
pub enum HoldOutcome {
    Held(SlotReservation),
    Conflict,
}

#[derive(Debug, Clone)]
pub enum ConsumeOutcome {
    /// This call consumed the reservation and created the meeting.
    Consumed(Meeting),
    /// Someone consumed it before; the meeting may belong to another payer.
    AlreadyConsumed(Meeting),
    /// Still held, but checkout attached a different gateway session to it.
    SessionMismatch { attached: String },
    Expired,
    Cancelled,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotHeld(ReservationStatus),
    NotFound,
}
