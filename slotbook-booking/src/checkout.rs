use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use slotbook_core::repository::PaymentSessionRepository;
use slotbook_core::{GatewayError, Money, PaymentGateway, PaymentSession, RepositoryError};
use slotbook_shared::Masked;

use crate::idempotency::{IdempotencyError, IdempotencyLedger};
use crate::reservation::{ReservationError, SlotReservationManager};

const OPERATION: &str = "checkout";

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub provider_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub client_contact: Masked<String>,
    pub idempotency_key: String,
    pub amount: Money,
}

impl CheckoutRequest {
    /// Ledger scope for this caller and request body. Reusing a key with another
    /// contact or another slot misses instead of replaying a stranger's receipt.
    fn idempotency_scope(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.client_contact.expose().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.provider_id.as_bytes());
        hasher.update(self.start_time.to_rfc3339().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.duration_minutes.to_be_bytes());
        hasher.update(self.amount.amount_minor.to_be_bytes());
        hasher.update(self.amount.currency.as_bytes());
        let digest = hasher.finalize();
        format!("{}:{}", OPERATION, hex::encode(&digest[..16]))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutReceipt {
    pub reservation_id: Uuid,
    pub gateway_checkout_url: String,
    pub gateway_session_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum CheckoutError {
    #[error("Slot is not available")]
    SlotConflict,

    #[error("Invalid checkout request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Storage(#[from] RepositoryError),
}

impl From<ReservationError> for CheckoutError {
    fn from(err: ReservationError) -> Self {
        match err {
            ReservationError::Conflict | ReservationError::NotHeld(_) => CheckoutError::SlotConflict,
            ReservationError::InvalidRequest(msg) => CheckoutError::InvalidRequest(msg),
            ReservationError::Storage(e) => CheckoutError::Storage(e),
        }
    }
}

impl From<IdempotencyError> for CheckoutError {
    fn from(err: IdempotencyError) -> Self {
        CheckoutError::InvalidRequest(err.to_string())
    }
}

/// Hold a slot and open a hosted payment for it.
pub struct CheckoutService {
    reservations: Arc<SlotReservationManager>,
    sessions: Arc<dyn PaymentSessionRepository>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: Arc<IdempotencyLedger>,
    hold_ttl_seconds: u64,
}

impl CheckoutService {
    pub fn new(
        reservations: Arc<SlotReservationManager>,
        sessions: Arc<dyn PaymentSessionRepository>,
        gateway: Arc<dyn PaymentGateway>,
        ledger: Arc<IdempotencyLedger>,
        hold_ttl_seconds: u64,
    ) -> Self {
        Self {
            reservations,
            sessions,
            gateway,
            ledger,
            hold_ttl_seconds,
        }
    }

    /// A retried request with the same idempotency key gets the first receipt back
    /// without a second hold or gateway session.
    pub async fn initiate(&self, req: CheckoutRequest) -> Result<CheckoutReceipt, CheckoutError> {
        if req.amount.amount_minor <= 0 {
            return Err(CheckoutError::InvalidRequest("amount must be positive".to_string()));
        }

        let scope = req.idempotency_scope();
        if let Some(receipt) = self
            .ledger
            .check::<CheckoutReceipt>(&scope, &req.idempotency_key)
            .await?
        {
            info!(reservation_id = %receipt.reservation_id, "Replaying checkout");
            return Ok(receipt);
        }

        let reservation = self
            .reservations
            .hold(
                req.provider_id,
                req.start_time,
                req.duration_minutes,
                req.client_contact.clone(),
                self.hold_ttl_seconds,
            )
            .await?;

        let checkout = match self.gateway.create_checkout_session(&reservation, &req.amount).await {
            Ok(c) => c,
            Err(e) => {
                warn!(reservation_id = %reservation.id, "Checkout session failed, releasing hold: {}", e);
                if let Err(release_err) = self.reservations.release(reservation.id).await {
                    warn!(reservation_id = %reservation.id, "Release failed, hold will lapse: {}", release_err);
                }
                return Err(e.into());
            }
        };

        self.reservations
            .attach_session(reservation.id, &checkout.session_id)
            .await?;

        let session = PaymentSession::new(
            checkout.session_id.clone(),
            reservation.id,
            req.amount.clone(),
            self.reservations.now(),
        );
        self.sessions.create_session(&session).await?;

        let receipt = CheckoutReceipt {
            reservation_id: reservation.id,
            gateway_checkout_url: checkout.checkout_url,
            gateway_session_id: checkout.session_id,
            expires_at: reservation.expires_at,
        };

        let shared = self
            .ledger
            .record(&scope, &req.idempotency_key, &receipt, None)
            .await?;
        if !shared {
            debug!(reservation_id = %receipt.reservation_id, "Checkout receipt kept only locally");
        }

        info!(
            reservation_id = %receipt.reservation_id,
            session_id = %receipt.gateway_session_id,
            "Checkout initiated"
        );
        Ok(receipt)
    }
}
