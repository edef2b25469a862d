use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::booking::Money;
use crate::hold::SlotReservation;
use crate::CoreError;

/// Per gateway session settlement lattice:
/// `INITIATED → AUTHORIZING → {SUCCEEDED, FAILED} → {CONFIRMED, REFUND_PENDING} → REFUND_ISSUED`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementState {
    Initiated,
    Authorizing,
    Succeeded,
    Failed,
    Confirmed,
    RefundPending,
    RefundIssued,
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Initiated => "INITIATED",
            SettlementState::Authorizing => "AUTHORIZING",
            SettlementState::Succeeded => "SUCCEEDED",
            SettlementState::Failed => "FAILED",
            SettlementState::Confirmed => "CONFIRMED",
            SettlementState::RefundPending => "REFUND_PENDING",
            SettlementState::RefundIssued => "REFUND_ISSUED",
        }
    }

    /// Sticky: once reached, later events never move the session again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SettlementState::Confirmed | SettlementState::RefundIssued | SettlementState::Failed
        )
    }

    /// Transitions only ever move forward in the lattice.
    pub fn can_advance_to(&self, next: SettlementState) -> bool {
        use SettlementState::*;
        match self {
            Initiated => matches!(next, Authorizing | Succeeded | Failed | Confirmed | RefundPending),
            Authorizing => matches!(next, Succeeded | Failed | Confirmed | RefundPending),
            Succeeded => matches!(next, Confirmed | RefundPending),
            RefundPending => matches!(next, RefundIssued),
            Failed | Confirmed | RefundIssued => false,
        }
    }
}

impl FromStr for SettlementState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIATED" => Ok(SettlementState::Initiated),
            "AUTHORIZING" => Ok(SettlementState::Authorizing),
            "SUCCEEDED" => Ok(SettlementState::Succeeded),
            "FAILED" => Ok(SettlementState::Failed),
            "CONFIRMED" => Ok(SettlementState::Confirmed),
            "REFUND_PENDING" => Ok(SettlementState::RefundPending),
            "REFUND_ISSUED" => Ok(SettlementState::RefundIssued),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Settlement progress for one gateway checkout session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSession {
    pub gateway_session_id: String,
    pub reservation_id: Uuid,
    pub state: SettlementState,
    pub amount: Money,
    /// Gateway-specific data needed to resume a payment that requires action
    /// (e.g. a voucher or bank-transfer display reference).
    pub continuation: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentSession {
    pub fn new(gateway_session_id: String, reservation_id: Uuid, amount: Money, now: DateTime<Utc>) -> Self {
        Self {
            gateway_session_id,
            reservation_id,
            state: SettlementState::Initiated,
            amount,
            continuation: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Hosted checkout created at the gateway for a reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutSession {
    pub session_id: String,
    pub checkout_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub gateway_refund_id: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    /// Network failure, timeout, 5xx. Safe to retry.
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),
    /// The gateway refused the request. Retrying the same request will not help.
    #[error("Payment gateway rejected request: {0}")]
    Rejected(String),
}

impl GatewayError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a hosted checkout tagged with the reservation id.
    async fn create_checkout_session(
        &self,
        reservation: &SlotReservation,
        amount: &Money,
    ) -> Result<CheckoutSession, GatewayError>;

    /// Refund whatever was captured for a session.
    async fn refund(
        &self,
        gateway_session_id: &str,
        amount: &Money,
        idempotency_key: &str,
    ) -> Result<RefundReceipt, GatewayError>;
}
