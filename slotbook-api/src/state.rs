use std::sync::Arc;
use std::time::Duration;

use slotbook_booking::{
    CheckoutService, IdempotencyLedger, NotificationDispatcher, RateLimiter, RefundCoordinator,
    RetryPolicy, SettlementEngine, SlotReservationManager, WebhookVerifier,
};
use slotbook_core::repository::{
    MeetingRepository, PaymentSessionRepository, RefundRepository, ReservationRepository,
};
use slotbook_core::{CacheStore, Clock, PaymentGateway};
use slotbook_store::app_config::{Config, RateLimits};

use crate::middleware::resiliency::CircuitBreaker;

#[derive(Clone)]
pub struct AuthConfig {
    pub secret: String,
}

pub struct ResiliencyState {
    pub checkout_cb: CircuitBreaker,
}

impl Default for ResiliencyState {
    fn default() -> Self {
        Self {
            checkout_cb: CircuitBreaker::new("payment-gateway", 5, Duration::from_secs(30)),
        }
    }
}

/// Adapters the engine runs on. Postgres/Redis in the binary, in-memory in tests.
pub struct Ports {
    pub reservations: Arc<dyn ReservationRepository>,
    pub meetings: Arc<dyn MeetingRepository>,
    pub sessions: Arc<dyn PaymentSessionRepository>,
    pub refunds: Arc<dyn RefundRepository>,
    pub cache: Arc<dyn CacheStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct AppState {
    pub checkout: Arc<CheckoutService>,
    pub reservations: Arc<SlotReservationManager>,
    pub settlement: Arc<SettlementEngine>,
    pub refunds: Arc<RefundCoordinator>,
    pub rate_limiter: Arc<RateLimiter>,
    pub rate_limits: RateLimits,
    pub auth: AuthConfig,
    pub resiliency: Arc<ResiliencyState>,
}

impl AppState {
    pub fn build(ports: Ports, config: &Config, dispatcher: NotificationDispatcher) -> Self {
        let rules = &config.business_rules;

        let reservations = Arc::new(SlotReservationManager::new(
            ports.reservations.clone(),
            ports.clock.clone(),
        ));
        let ledger = Arc::new(IdempotencyLedger::new(
            ports.cache.clone(),
            ports.clock.clone(),
            Duration::from_secs(rules.idempotency_ttl_seconds),
        ));
        let refunds = Arc::new(RefundCoordinator::new(
            ports.refunds,
            ports.meetings.clone(),
            ports.sessions.clone(),
            ports.reservations,
            ports.gateway.clone(),
            dispatcher.clone(),
            ports.clock.clone(),
            RetryPolicy::new(
                config.refunds.base_backoff_seconds,
                config.refunds.max_backoff_seconds,
            ),
        ));
        let settlement = Arc::new(SettlementEngine::new(
            WebhookVerifier::new(
                config.gateway.webhook_secret.clone(),
                config.gateway.signature_tolerance_seconds,
            ),
            reservations.clone(),
            ports.meetings,
            ports.sessions.clone(),
            refunds.clone(),
            ports.cache.clone(),
            dispatcher,
            ports.clock.clone(),
            Duration::from_secs(rules.webhook_dedup_ttl_seconds),
        ));
        let checkout = Arc::new(CheckoutService::new(
            reservations.clone(),
            ports.sessions,
            ports.gateway,
            ledger,
            rules.hold_ttl_seconds,
        ));

        Self {
            checkout,
            reservations,
            settlement,
            refunds,
            rate_limiter: Arc::new(RateLimiter::new(ports.cache, ports.clock)),
            rate_limits: config.rate_limits.clone(),
            auth: AuthConfig {
                secret: config.auth.jwt_secret.clone(),
            },
            resiliency: Arc::new(ResiliencyState::default()),
        }
    }
}
