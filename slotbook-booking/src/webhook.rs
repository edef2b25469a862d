//! Payment gateway webhook envelope: signature verification and typed parsing.

use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use uuid::Uuid;

use slotbook_core::Money;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "slotbook-signature";

/// Where a payment intent carries the checkout session it was created for.
pub const CHECKOUT_SESSION_POINTER: &str = "/metadata/checkout_session_id";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("Signature header is malformed")]
    MalformedHeader,
    #[error("Signature timestamp outside tolerance")]
    StaleTimestamp,
    #[error("Signature does not match payload")]
    Mismatch,
}

/// Checks `t=<unix>,v1=<hex>` headers where `v1 = HMAC-SHA256(secret, "<t>.<body>")`.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: String,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, tolerance_seconds: i64) -> Self {
        Self {
            secret: secret.into(),
            tolerance: Duration::seconds(tolerance_seconds),
        }
    }

    fn mac(&self, timestamp: i64, payload: &[u8]) -> HmacSha256 {
        // HMAC accepts keys of any length
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac
    }

    /// Header value the gateway would send for `payload` at `timestamp`.
    pub fn sign(&self, payload: &[u8], timestamp: i64) -> String {
        let digest = self.mac(timestamp, payload).finalize().into_bytes();
        format!("t={},v1={}", timestamp, hex::encode(digest))
    }

    pub fn verify(&self, payload: &[u8], header: &str, now: DateTime<Utc>) -> Result<(), SignatureError> {
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<Vec<u8>> = Vec::new();

        for part in header.split(',') {
            let Some((k, v)) = part.trim().split_once('=') else {
                continue;
            };
            match k {
                "t" => timestamp = v.parse().ok(),
                "v1" => {
                    if let Ok(bytes) = hex::decode(v) {
                        candidates.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
        if candidates.is_empty() {
            return Err(SignatureError::MalformedHeader);
        }

        let skew = now
            .timestamp()
            .checked_sub(timestamp)
            .ok_or(SignatureError::StaleTimestamp)?;
        if skew.unsigned_abs() > self.tolerance.num_seconds().unsigned_abs() {
            return Err(SignatureError::StaleTimestamp);
        }

        // verify_slice compares in constant time
        let matched = candidates
            .iter()
            .any(|sig| self.mac(timestamp, payload).verify_slice(sig).is_ok());

        if matched {
            Ok(())
        } else {
            Err(SignatureError::Mismatch)
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    object: Value,
}

/// A verified delivery, not yet interpreted.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl WebhookEvent {
    pub fn from_json(body: &[u8], received_at: DateTime<Utc>) -> Result<Self, MalformedEvent> {
        let envelope: Envelope =
            serde_json::from_slice(body).map_err(|e| MalformedEvent(format!("envelope: {}", e)))?;
        if envelope.id.trim().is_empty() {
            return Err(MalformedEvent("empty event id".to_string()));
        }
        Ok(Self {
            event_id: envelope.id,
            event_type: envelope.event_type,
            payload: envelope.data.object,
            received_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Malformed webhook event: {0}")]
pub struct MalformedEvent(pub String);

#[derive(Debug, Clone, PartialEq)]
pub struct ActionRequired {
    pub session_id: String,
    pub reservation_id: Uuid,
    pub amount: Option<Money>,
    pub continuation: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentSucceeded {
    pub session_id: String,
    pub reservation_id: Uuid,
    pub amount: Money,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PaymentFailed {
    pub session_id: String,
    pub reservation_id: Uuid,
    pub amount: Option<Money>,
    pub reason: Option<String>,
}

/// The event shapes settlement acts on. Each variant is validated for the
/// fields it needs before any state is touched.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    RequiresAction(ActionRequired),
    Succeeded(PaymentSucceeded),
    Failed(PaymentFailed),
    Unhandled(String),
}

impl GatewayEvent {
    pub fn parse(event: &WebhookEvent) -> Result<Self, MalformedEvent> {
        let object = &event.payload;
        let event_type = event.event_type.as_str();

        // Payment intents are a different object from the checkout session. They
        // only count when they name the session they belong to.
        let session = if event_type.starts_with("payment_intent.") {
            match object
                .pointer(CHECKOUT_SESSION_POINTER)
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
            {
                Some(id) => id.to_string(),
                None => return Ok(GatewayEvent::Unhandled(event_type.to_string())),
            }
        } else {
            object
                .get("id")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .ok_or_else(|| MalformedEvent("missing data.object.id".to_string()))?
        };

        match event_type {
            "checkout.session.completed" => {
                // async methods (vouchers, bank debits) complete the session unpaid
                if object.get("payment_status").and_then(Value::as_str) == Some("unpaid") {
                    Ok(GatewayEvent::RequiresAction(action_required(session, object)?))
                } else {
                    Ok(GatewayEvent::Succeeded(succeeded(session, object)?))
                }
            }
            "checkout.session.async_payment_succeeded" | "payment_intent.succeeded" => {
                Ok(GatewayEvent::Succeeded(succeeded(session, object)?))
            }
            "payment_intent.requires_action" | "payment_intent.processing" => {
                Ok(GatewayEvent::RequiresAction(action_required(session, object)?))
            }
            "checkout.session.async_payment_failed"
            | "checkout.session.expired"
            | "payment_intent.payment_failed"
            | "payment_intent.canceled" => Ok(GatewayEvent::Failed(failed(session, object)?)),
            other => Ok(GatewayEvent::Unhandled(other.to_string())),
        }
    }
}

fn reservation_id(object: &Value) -> Result<Uuid, MalformedEvent> {
    let raw = object
        .pointer("/metadata/reservation_id")
        .or_else(|| object.get("client_reference_id"))
        .and_then(Value::as_str)
        .ok_or_else(|| MalformedEvent("missing metadata.reservation_id".to_string()))?;
    Uuid::parse_str(raw).map_err(|_| MalformedEvent(format!("invalid reservation id {}", raw)))
}

fn amount(object: &Value) -> Option<Money> {
    let minor = object
        .get("amount_total")
        .or_else(|| object.get("amount_received"))
        .or_else(|| object.get("amount"))
        .and_then(Value::as_i64)?;
    let currency = object.get("currency").and_then(Value::as_str)?;
    Some(Money::new(minor, currency))
}

fn action_required(session_id: String, object: &Value) -> Result<ActionRequired, MalformedEvent> {
    Ok(ActionRequired {
        session_id,
        reservation_id: reservation_id(object)?,
        amount: amount(object),
        continuation: object.get("next_action").filter(|v| !v.is_null()).cloned(),
    })
}

fn succeeded(session_id: String, object: &Value) -> Result<PaymentSucceeded, MalformedEvent> {
    Ok(PaymentSucceeded {
        session_id,
        reservation_id: reservation_id(object)?,
        amount: amount(object)
            .ok_or_else(|| MalformedEvent("missing amount or currency".to_string()))?,
    })
}

fn failed(session_id: String, object: &Value) -> Result<PaymentFailed, MalformedEvent> {
    Ok(PaymentFailed {
        session_id,
        reservation_id: reservation_id(object)?,
        amount: amount(object),
        reason: object
            .pointer("/last_payment_error/message")
            .or_else(|| object.get("cancellation_reason"))
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}
