use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use slotbook_core::{ReleaseOutcome, ReservationStatus, SlotReservation};

use crate::error::AppError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/v1/reservations/{id}",
        get(get_reservation).delete(release_reservation),
    )
}

/// Public view of a reservation. The client contact is never echoed back.
#[derive(Debug, Serialize)]
pub struct ReservationView {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub start_time: DateTime<Utc>,
    pub duration_minutes: i32,
    pub status: ReservationStatus,
    pub expires_at: DateTime<Utc>,
}

impl From<SlotReservation> for ReservationView {
    fn from(r: SlotReservation) -> Self {
        Self {
            id: r.id,
            provider_id: r.provider_id,
            start_time: r.start_time,
            duration_minutes: r.duration_minutes,
            status: r.status,
            expires_at: r.expires_at,
        }
    }
}

/// GET /v1/reservations/{id}
async fn get_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReservationView>, AppError> {
    let reservation = state
        .reservations
        .get(id)
        .await?
        .ok_or_else(|| AppError::NotFoundError(format!("Reservation {} not found", id)))?;
    Ok(Json(reservation.into()))
}

/// DELETE /v1/reservations/{id}
/// Client abandons checkout. Only a HELD reservation can be released.
async fn release_reservation(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    match state.reservations.release(id).await? {
        ReleaseOutcome::Released => Ok(StatusCode::NO_CONTENT),
        ReleaseOutcome::NotHeld(status) => Err(AppError::ConflictError(format!(
            "Reservation {} is {}",
            id,
            status.as_str()
        ))),
        ReleaseOutcome::NotFound => Err(AppError::NotFoundError(format!("Reservation {} not found", id))),
    }
}
