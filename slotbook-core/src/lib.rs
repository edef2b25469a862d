pub mod booking;
pub mod cache;
pub mod clock;
pub mod hold;
pub mod notify;
pub mod payment;
pub mod refund;
pub mod repository;

pub use booking::{BookingStatus, Meeting, Money};
pub use cache::{CacheBackend, CacheError, CacheOutcome, CacheStore, InMemoryCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use hold::{ConsumeOutcome, HoldOutcome, ReleaseOutcome, ReservationStatus, SlotReservation};
pub use payment::{GatewayError, PaymentGateway, PaymentSession, SettlementState};
pub use refund::{RefundRecord, RefundStatus};
pub use repository::{RepositoryError, RepositoryResult};

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Unknown status value: {0}")]
    UnknownStatus(String),
}
