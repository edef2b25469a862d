use axum::{
    extract::{ConnectInfo, Request, State},
    http::Method,
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;

use slotbook_booking::{RateLimitScope, Sensitivity};
use slotbook_store::app_config::{RateLimitPolicy, RateLimits};

use crate::error::AppError;
use crate::middleware::auth::Claims;
use crate::state::AppState;

/// Which limit family a request falls under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitedOperation {
    Checkout,
    Approval,
    Release,
}

impl LimitedOperation {
    pub fn classify(method: &Method, path: &str) -> Option<Self> {
        if *method == Method::POST && path == "/v1/checkout" {
            Some(LimitedOperation::Checkout)
        } else if *method == Method::POST && path.starts_with("/v1/admin/refunds/") && path.ends_with("/retry") {
            Some(LimitedOperation::Approval)
        } else if *method == Method::DELETE && path.starts_with("/v1/reservations/") {
            Some(LimitedOperation::Release)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LimitedOperation::Checkout => "checkout",
            LimitedOperation::Approval => "approval",
            LimitedOperation::Release => "release",
        }
    }

    pub fn sensitivity(&self) -> Sensitivity {
        match self {
            LimitedOperation::Checkout | LimitedOperation::Approval => Sensitivity::Financial,
            LimitedOperation::Release => Sensitivity::Standard,
        }
    }

    fn policy(&self, limits: &RateLimits) -> RateLimitPolicy {
        match self {
            LimitedOperation::Checkout => limits.checkout,
            LimitedOperation::Approval => limits.approval,
            LimitedOperation::Release => limits.release,
        }
    }
}

/// Scopes for one request: per user (when authenticated), per IP, and global.
pub fn scopes_for(
    op: LimitedOperation,
    limits: &RateLimits,
    user: Option<&str>,
    ip: &str,
) -> Vec<RateLimitScope> {
    let policy = op.policy(limits);
    let window = policy.window_seconds.max(1) as u64;
    let limit = |n: i64| n.max(0) as u64;
    let op = op.as_str();

    let mut scopes = Vec::with_capacity(3);
    if let Some(user) = user {
        scopes.push(RateLimitScope::new(format!("{}:user:{}", op, user), limit(policy.per_user), window));
    }
    scopes.push(RateLimitScope::new(format!("{}:ip:{}", op, ip), limit(policy.per_ip), window));
    scopes.push(RateLimitScope::new(format!("{}:global", op), limit(policy.global), window));
    scopes
}

fn client_ip(req: &Request) -> String {
    req.headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip().to_string())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let op = LimitedOperation::classify(req.method(), req.uri().path());
    let Some(op) = op else {
        return Ok(next.run(req).await);
    };

    let ip = client_ip(&req);
    let user = req.extensions().get::<Claims>().map(|c| c.sub.clone());
    let scopes = scopes_for(op, &state.rate_limits, user.as_deref(), &ip);

    let decision = state.rate_limiter.check_all(&scopes, op.sensitivity()).await;
    if decision.allowed {
        return Ok(next.run(req).await);
    }

    if decision.degraded {
        return Err(AppError::ServiceUnavailable(format!(
            "{} temporarily unavailable: rate limit counters degraded",
            op.as_str()
        )));
    }

    let retry_after_seconds = decision.retry_after_seconds(state.rate_limiter.now());
    tracing::info!(
        scope = %decision.scope,
        retry_after_seconds,
        "Rate limit exceeded"
    );
    Err(AppError::RateLimited {
        message: format!("Rate limit exceeded for {}", op.as_str()),
        retry_after_seconds,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RateLimits {
        let policy = RateLimitPolicy {
            per_user: 5,
            per_ip: 10,
            global: 100,
            window_seconds: 60,
        };
        RateLimits {
            checkout: policy,
            approval: RateLimitPolicy { per_user: 1, ..policy },
            release: policy,
        }
    }

    #[test]
    fn classifies_limited_routes() {
        assert_eq!(
            LimitedOperation::classify(&Method::POST, "/v1/checkout"),
            Some(LimitedOperation::Checkout)
        );
        assert_eq!(
            LimitedOperation::classify(&Method::POST, "/v1/admin/refunds/cs_1/retry"),
            Some(LimitedOperation::Approval)
        );
        assert_eq!(
            LimitedOperation::classify(&Method::DELETE, "/v1/reservations/abc"),
            Some(LimitedOperation::Release)
        );
        assert_eq!(LimitedOperation::classify(&Method::GET, "/v1/reservations/abc"), None);
        assert_eq!(LimitedOperation::classify(&Method::POST, "/v1/webhooks/payments"), None);
    }

    #[test]
    fn payment_adjacent_operations_fail_closed() {
        assert_eq!(LimitedOperation::Checkout.sensitivity(), Sensitivity::Financial);
        assert_eq!(LimitedOperation::Approval.sensitivity(), Sensitivity::Financial);
        assert_eq!(LimitedOperation::Release.sensitivity(), Sensitivity::Standard);
    }

    #[test]
    fn anonymous_callers_skip_user_scope() {
        let scopes = scopes_for(LimitedOperation::Checkout, &limits(), None, "10.0.0.1");
        let keys: Vec<_> = scopes.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["checkout:ip:10.0.0.1", "checkout:global"]);

        let scopes = scopes_for(LimitedOperation::Approval, &limits(), Some("u1"), "10.0.0.1");
        assert_eq!(scopes[0].key, "approval:user:u1");
        assert_eq!(scopes[0].limit, 1);
        assert_eq!(scopes[0].window_seconds, 60);
    }
}
