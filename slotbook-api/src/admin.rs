use axum::{
    extract::{Extension, Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use slotbook_core::RefundRecord;

use crate::error::AppError;
use crate::middleware::{admin_auth_middleware, Claims};
use crate::state::AppState;

// ============================================================================
// Operations endpoints (ADMIN only)
// ============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v1/admin/refunds/pending", get(list_pending_refunds))
        .route("/v1/admin/refunds/{session_id}/retry", post(retry_refund))
        .route_layer(axum::middleware::from_fn(admin_auth_middleware))
}

#[derive(Debug, Serialize)]
pub struct RefundBacklog {
    pub count: usize,
    pub refunds: Vec<RefundRecord>,
}

/// GET /v1/admin/refunds/pending
async fn list_pending_refunds(State(state): State<AppState>) -> Result<Json<RefundBacklog>, AppError> {
    let refunds = state.refunds.pending_backlog().await?;
    Ok(Json(RefundBacklog {
        count: refunds.len(),
        refunds,
    }))
}

/// POST /v1/admin/refunds/{session_id}/retry
/// Approves an immediate attempt for a refund that is waiting out its backoff.
async fn retry_refund(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(session_id): Path<String>,
) -> Result<Json<RefundRecord>, AppError> {
    tracing::info!(
        gateway_session_id = %session_id,
        approved_by = %claims.sub,
        "Manual refund retry approved"
    );
    let record = state.refunds.retry_now(&session_id).await?;
    Ok(Json(record))
}
