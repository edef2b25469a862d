use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::json;

use slotbook_booking::SettlementOutcome;

use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "slotbook-signature";

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/webhooks/payments", post(handle_payment_webhook))
}

/// POST /v1/webhooks/payments
/// Any 2xx stops gateway redelivery. Protocol errors get 400, everything else
/// 500 so the gateway tries again.
async fn handle_payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or_default();

    match state.settlement.handle_webhook_event(&body, signature).await {
        Ok(outcome) => {
            let mut payload = json!({ "received": true, "outcome": outcome.as_str() });
            if let SettlementOutcome::Confirmed { meeting_id } = &outcome {
                payload["meeting_id"] = json!(meeting_id);
            }
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(e) if e.is_client_error() => {
            tracing::warn!("Webhook rejected: {}", e);
            (StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string() }))).into_response()
        }
        Err(e) => {
            tracing::error!("Webhook processing failed, gateway will redeliver: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Temporary failure" })),
            )
                .into_response()
        }
    }
}
