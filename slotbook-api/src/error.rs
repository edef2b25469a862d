use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use slotbook_booking::checkout::CheckoutError;
use slotbook_booking::refund::RefundError;
use slotbook_booking::reservation::ReservationError;
use slotbook_core::{GatewayError, RepositoryError};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    AuthenticationError(String),
    #[error("{0}")]
    AuthorizationError(String),
    #[error("{0}")]
    ValidationError(String),
    #[error("{0}")]
    NotFoundError(String),
    #[error("{0}")]
    ConflictError(String),
    #[error("{message}")]
    RateLimited { message: String, retry_after_seconds: u64 },
    #[error("{0}")]
    UpstreamError(String),
    #[error("{0}")]
    ServiceUnavailable(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::AuthenticationError(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::AuthorizationError(msg) => (StatusCode::FORBIDDEN, msg),
            AppError::ValidationError(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFoundError(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ConflictError(msg) => (StatusCode::CONFLICT, msg),
            AppError::RateLimited {
                message,
                retry_after_seconds,
            } => {
                let body = Json(json!({
                    "error": message,
                    "retry_after_seconds": retry_after_seconds,
                }));
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, retry_after_seconds.to_string())],
                    body,
                )
                    .into_response();
            }
            AppError::UpstreamError(msg) => {
                tracing::warn!("Upstream failure: {}", msg);
                (StatusCode::BAD_GATEWAY, "Payment provider unavailable".to_string())
            }
            AppError::ServiceUnavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            AppError::Anyhow(err) => {
                tracing::error!("Internal Server Error: {:#}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound(what) => AppError::NotFoundError(format!("{} not found", what)),
            RepositoryError::Unavailable(msg) => AppError::ServiceUnavailable(format!("storage: {}", msg)),
            other => AppError::Anyhow(anyhow::Error::new(other)),
        }
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError::UpstreamError(err.to_string())
    }
}

impl From<CheckoutError> for AppError {
    fn from(err: CheckoutError) -> Self {
        match err {
            CheckoutError::SlotConflict => AppError::ConflictError(err.to_string()),
            CheckoutError::InvalidRequest(msg) => AppError::ValidationError(msg),
            CheckoutError::Gateway(e) => e.into(),
            CheckoutError::Storage(e) => e.into(),
        }
    }
}

impl From<ReservationError> for AppError {
    fn from(err: ReservationError) -> Self {
        match err {
            ReservationError::Conflict | ReservationError::NotHeld(_) => AppError::ConflictError(err.to_string()),
            ReservationError::InvalidRequest(msg) => AppError::ValidationError(msg),
            ReservationError::Storage(e) => e.into(),
        }
    }
}

impl From<RefundError> for AppError {
    fn from(err: RefundError) -> Self {
        match err {
            RefundError::UnknownSession(_) | RefundError::NotFound(_) => AppError::NotFoundError(err.to_string()),
            RefundError::Storage(e) => e.into(),
        }
    }
}
