use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use slotbook_core::payment::{CheckoutSession, RefundReceipt};
use slotbook_core::{GatewayError, Money, PaymentGateway, SlotReservation};

/// Sandbox gateway: hosted checkout URLs under `checkout_base_url`, refunds
/// acknowledged locally. Failures can be injected to exercise retries.
pub struct MockPaymentGateway {
    checkout_base_url: String,
    fail_checkout: AtomicBool,
    refund_failures_remaining: AtomicUsize,
    refund_calls: AtomicUsize,
    refunds: Mutex<HashMap<String, RefundReceipt>>,
}

impl MockPaymentGateway {
    pub fn new(checkout_base_url: impl Into<String>) -> Self {
        Self {
            checkout_base_url: checkout_base_url.into(),
            fail_checkout: AtomicBool::new(false),
            refund_failures_remaining: AtomicUsize::new(0),
            refund_calls: AtomicUsize::new(0),
            refunds: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_checkouts(&self, fail: bool) {
        self.fail_checkout.store(fail, Ordering::SeqCst);
    }

    /// The next `n` refund calls fail as if the gateway were down.
    pub fn fail_next_refunds(&self, n: usize) {
        self.refund_failures_remaining.store(n, Ordering::SeqCst);
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }

    /// Distinct refunds the gateway actually moved money for.
    pub fn refunds_issued(&self) -> usize {
        self.refunds.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl Default for MockPaymentGateway {
    fn default() -> Self {
        Self::new("https://checkout.sandbox.local/pay")
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    async fn create_checkout_session(
        &self,
        reservation: &SlotReservation,
        amount: &Money,
    ) -> Result<CheckoutSession, GatewayError> {
        if self.fail_checkout.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("sandbox checkout disabled".to_string()));
        }
        if amount.amount_minor <= 0 {
            return Err(GatewayError::Rejected("amount must be positive".to_string()));
        }

        let session_id = format!("cs_mock_{}", Uuid::new_v4().simple());
        tracing::info!(
            reservation_id = %reservation.id,
            session_id = %session_id,
            "Sandbox checkout session created"
        );
        Ok(CheckoutSession {
            checkout_url: format!("{}/{}", self.checkout_base_url.trim_end_matches('/'), session_id),
            session_id,
        })
    }

    async fn refund(
        &self,
        gateway_session_id: &str,
        _amount: &Money,
        idempotency_key: &str,
    ) -> Result<RefundReceipt, GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);

        let failing = self
            .refund_failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(GatewayError::Unavailable("sandbox refund outage".to_string()));
        }

        let mut refunds = self
            .refunds
            .lock()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;
        let receipt = refunds
            .entry(idempotency_key.to_string())
            .or_insert_with(|| RefundReceipt {
                gateway_refund_id: format!("re_mock_{}", Uuid::new_v4().simple()),
            })
            .clone();

        tracing::info!(
            session_id = %gateway_session_id,
            refund_id = %receipt.gateway_refund_id,
            "Sandbox refund issued"
        );
        Ok(receipt)
    }
}
