use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
}

/// Per-process breaker in front of the payment gateway. Trips after
/// `failure_threshold` consecutive server errors, lets one probe through after
/// `reset_timeout`.
pub struct CircuitBreaker {
    pub name: String,
    inner: Mutex<Inner>,
    failure_count: AtomicUsize,
    failure_threshold: usize,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(name: &str, threshold: usize, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
            }),
            failure_count: AtomicUsize::new(0),
            failure_threshold: threshold.max(1),
            reset_timeout: timeout,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().map(|i| i.state).unwrap_or(CircuitState::Open)
    }

    pub fn check(&self) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.reset_timeout);
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!("Circuit Breaker [{}] moving to Half-Open", self.name);
                }
                cooled
            }
        }
    }

    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state == CircuitState::HalfOpen {
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                tracing::info!("Circuit Breaker [{}] recovered to Closed", self.name);
            }
        }
    }

    pub fn record_failure(&self) {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut inner) = self.inner.lock() {
            if count >= self.failure_threshold || inner.state == CircuitState::HalfOpen {
                if inner.state != CircuitState::Open {
                    tracing::error!("Circuit Breaker [{}] tripped to Open after {} failures", self.name, count);
                }
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
            }
        }
    }
}

pub async fn circuit_breaker_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let guarded = req.method() == Method::POST && req.uri().path() == "/v1/checkout";
    if !guarded {
        return next.run(req).await;
    }

    let cb = &state.resiliency.checkout_cb;
    if !cb.check() {
        return AppError::ServiceUnavailable(format!("Circuit Breaker [{}] is OPEN", cb.name)).into_response();
    }

    let response = next.run(req).await;
    if response.status().is_server_error() {
        cb.record_failure();
    } else {
        cb.record_success();
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_after_threshold_and_probes_after_timeout() {
        let cb = CircuitBreaker::new("gw", 2, Duration::from_millis(0));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        assert!(cb.check());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn failed_probe_reopens() {
        let cb = CircuitBreaker::new("gw", 1, Duration::from_secs(60));
        cb.record_failure();
        assert!(!cb.check());

        let cb = CircuitBreaker::new("gw", 1, Duration::from_millis(0));
        cb.record_failure();
        assert!(cb.check());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let cb = CircuitBreaker::new("gw", 2, Duration::from_secs(60));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
