pub mod checkout;
pub mod dispatch;
pub mod gateway;
pub mod idempotency;
pub mod memory;
pub mod rate_limit;
pub mod refund;
pub mod reservation;
pub mod settlement;
pub mod webhook;

pub use checkout::{CheckoutReceipt, CheckoutRequest, CheckoutService};
pub use dispatch::NotificationDispatcher;
pub use gateway::MockPaymentGateway;
pub use idempotency::IdempotencyLedger;
pub use memory::InMemoryBookingStore;
pub use rate_limit::{RateDecision, RateLimitScope, RateLimiter, Sensitivity};
pub use refund::{RefundCoordinator, RetryPolicy};
pub use reservation::SlotReservationManager;
pub use settlement::{SettlementEngine, SettlementError, SettlementOutcome};
pub use webhook::{GatewayEvent, WebhookEvent, WebhookVerifier};
