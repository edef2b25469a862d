use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::str::FromStr;

use slotbook_shared::Masked;
use crate::CoreError;

/// An amount in the currency's minor unit (cents, pence, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    pub amount_minor: i64,
    pub currency: String,
}

impl Money {
    pub fn new(amount_minor: i64, currency: impl Into<String>) -> Self {
        Self {
            amount_minor,
            currency: currency.into().to_uppercase(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Refunded,
    Failed,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "PENDING",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Refunded => "REFUNDED",
            BookingStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for BookingStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(BookingStatus::Pending),
            "CONFIRMED" => Ok(BookingStatus::Confirmed),
            "REFUNDED" => Ok(BookingStatus::Refunded),
            "FAILED" => Ok(BookingStatus::Failed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// The durable booking record. One per paid reservation, keyed by the
/// gateway session that paid for it (`payment_reference`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meeting {
    pub id: Uuid,
    pub reservation_id: Uuid,
    pub provider_id: Uuid,
    pub client_contact: Masked<String>,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub payment_reference: String,
    pub amount: Money,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Meeting {
    pub fn paid_by(&self, gateway_session_id: &str) -> bool {
        self.payment_reference == gateway_session_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_storage_names() {
        for status in [
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            BookingStatus::Refunded,
            BookingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<BookingStatus>().unwrap(), status);
        }
        assert!("SHIPPED".parse::<BookingStatus>().is_err());
    }

    #[test]
    fn test_money_normalizes_currency() {
        assert_eq!(Money::new(5000, "eur").currency, "EUR");
    }
}
