use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::str::FromStr;

use crate::booking::Money;
use crate::CoreError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RefundStatus {
    Pending,
    Issued,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "PENDING",
            RefundStatus::Issued => "ISSUED",
        }
    }
}

impl FromStr for RefundStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(RefundStatus::Pending),
            "ISSUED" => Ok(RefundStatus::Issued),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// At most one per gateway session. A PENDING row is part of the operations
/// backlog until the gateway accepts the refund.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRecord {
    pub id: Uuid,
    pub gateway_session_id: String,
    pub reservation_id: Uuid,
    pub amount: Money,
    pub reason: String,
    pub status: RefundStatus,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub gateway_refund_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RefundRecord {
    pub fn pending(
        gateway_session_id: &str,
        reservation_id: Uuid,
        amount: Money,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            gateway_session_id: gateway_session_id.to_string(),
            reservation_id,
            amount,
            reason: reason.to_string(),
            status: RefundStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            last_error: None,
            gateway_refund_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_issued(&self) -> bool {
        self.status == RefundStatus::Issued
    }
}
