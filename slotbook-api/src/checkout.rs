use axum::{extract::State, http::StatusCode, routing::post, Json, Router};

use slotbook_booking::{CheckoutReceipt, CheckoutRequest};

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/checkout", post(initiate_checkout))
}

/// POST /v1/checkout
/// Hold the slot and return the hosted payment page. Replays with the same
/// idempotency key return the original receipt.
async fn initiate_checkout(
    State(state): State<AppState>,
    Json(req): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutReceipt>), AppError> {
    tracing::info!(
        provider_id = %req.provider_id,
        start_time = %req.start_time,
        "Checkout requested"
    );

    let receipt = state.checkout.initiate(req).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}
