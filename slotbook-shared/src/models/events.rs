use uuid::Uuid;
use chrono::{DateTime, Utc};

use crate::pii::Masked;

/// What happened to a booking, from the point of view of the client and the
/// provider's calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// Payment settled and the meeting is confirmed; calendar entry should be created.
    BookingConfirmed,
    /// Payment succeeded for a slot lost to another payer; money is being returned.
    BookingRefunded,
    /// Payment failed; any tentative calendar hold should be dropped.
    BookingFailed,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::BookingConfirmed => "booking.confirmed",
            NotificationKind::BookingRefunded => "booking.refunded",
            NotificationKind::BookingFailed => "booking.failed",
        }
    }
}

/// Request handed to the notification/calendar collaborators.
/// Delivered at least once; consumers dedupe on `notification_id`.
#[derive(Debug, serde::Serialize, serde::Deserialize, Clone)]
pub struct NotificationRequest {
    pub notification_id: Uuid,
    pub meeting_id: Option<Uuid>,
    pub reservation_id: Uuid,
    pub event_type: NotificationKind,
    pub client_contact: Masked<String>,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationRequest {
    pub fn new(
        event_type: NotificationKind,
        reservation_id: Uuid,
        meeting_id: Option<Uuid>,
        client_contact: Masked<String>,
    ) -> Self {
        Self {
            notification_id: Uuid::new_v4(),
            meeting_id,
            reservation_id,
            event_type,
            client_contact,
            detail: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Partition key for the event stream: meetings when we have one, reservation otherwise.
    pub fn routing_key(&self) -> String {
        self.meeting_id.unwrap_or(self.reservation_id).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key_prefers_meeting() {
        let reservation_id = Uuid::new_v4();
        let meeting_id = Uuid::new_v4();

        let without = NotificationRequest::new(
            NotificationKind::BookingRefunded,
            reservation_id,
            None,
            Masked::from("a@example.com"),
        );
        assert_eq!(without.routing_key(), reservation_id.to_string());

        let with = NotificationRequest::new(
            NotificationKind::BookingConfirmed,
            reservation_id,
            Some(meeting_id),
            Masked::from("a@example.com"),
        );
        assert_eq!(with.routing_key(), meeting_id.to_string());
    }

    #[test]
    fn test_event_type_wire_name() {
        let json = serde_json::to_value(NotificationKind::BookingConfirmed).unwrap();
        assert_eq!(json, "booking_confirmed");
        assert_eq!(NotificationKind::BookingFailed.as_str(), "booking.failed");
    }
}
