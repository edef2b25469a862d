use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use slotbook_core::repository::{MeetingRepository, ReservationRepository};
use slotbook_core::{
    BookingStatus, ConsumeOutcome, HoldOutcome, Meeting, Money, ReleaseOutcome, RepositoryError,
    RepositoryResult, ReservationStatus, SlotReservation,
};
use slotbook_shared::Masked;

use crate::database::{corrupt, db_error};

/// Reservations and meetings in Postgres. Overlap exclusivity is the
/// `slot_reservations_no_overlap` exclusion constraint.
pub struct StoreBookingRepository {
    pool: PgPool,
}

impl StoreBookingRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct ReservationRow {
    id: Uuid,
    provider_id: Uuid,
    start_time: DateTime<Utc>,
    duration_minutes: i32,
    client_contact: String,
    expires_at: DateTime<Utc>,
    gateway_session_id: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ReservationRow> for SlotReservation {
    type Error = RepositoryError;

    fn try_from(row: ReservationRow) -> Result<Self, Self::Error> {
        Ok(SlotReservation {
            id: row.id,
            provider_id: row.provider_id,
            start_time: row.start_time,
            duration_minutes: row.duration_minutes,
            client_contact: Masked(row.client_contact),
            expires_at: row.expires_at,
            gateway_session_id: row.gateway_session_id,
            status: row.status.parse().map_err(corrupt)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct MeetingRow {
    id: Uuid,
    reservation_id: Uuid,
    provider_id: Uuid,
    client_contact: String,
    start_time: DateTime<Utc>,
    duration_minutes: i32,
    payment_reference: String,
    amount_minor: i64,
    currency: String,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<MeetingRow> for Meeting {
    type Error = RepositoryError;

    fn try_from(row: MeetingRow) -> Result<Self, Self::Error> {
        Ok(Meeting {
            id: row.id,
            reservation_id: row.reservation_id,
            provider_id: row.provider_id,
            client_contact: Masked(row.client_contact),
            start_time: row.start_time,
            duration_minutes: row.duration_minutes,
            payment_reference: row.payment_reference,
            amount: Money::new(row.amount_minor, row.currency),
            status: row.status.parse().map_err(corrupt)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const RESERVATION_COLUMNS: &str = "id, provider_id, start_time, duration_minutes, client_contact, \
     expires_at, gateway_session_id, status, created_at";

const MEETING_COLUMNS: &str = "id, reservation_id, provider_id, client_contact, start_time, \
     duration_minutes, payment_reference, amount_minor, currency, status, created_at, updated_at";

async fn lock_reservation(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
) -> RepositoryResult<Option<SlotReservation>> {
    let row = sqlx::query_as::<_, ReservationRow>(&format!(
        "SELECT {} FROM slot_reservations WHERE id = $1 FOR UPDATE",
        RESERVATION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_error)?;

    row.map(SlotReservation::try_from).transpose()
}

async fn set_reservation_status(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    status: ReservationStatus,
) -> RepositoryResult<()> {
    sqlx::query("UPDATE slot_reservations SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_error)?;
    Ok(())
}

#[async_trait]
impl ReservationRepository for StoreBookingRepository {
    async fn insert_hold(
        &self,
        reservation: &SlotReservation,
        now: DateTime<Utc>,
    ) -> RepositoryResult<HoldOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // lazy expiry: stale holds on the requested range stop occupying it
        let expired = sqlx::query(
            r#"
            UPDATE slot_reservations SET status = 'EXPIRED'
            WHERE provider_id = $1
              AND status = 'HELD'
              AND expires_at <= $4
              AND tstzrange(start_time, end_time, '[)') && tstzrange($2, $3, '[)')
            "#,
        )
        .bind(reservation.provider_id)
        .bind(reservation.start_time)
        .bind(reservation.end_time())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if expired.rows_affected() > 0 {
            debug!(provider_id = %reservation.provider_id, count = expired.rows_affected(), "Expired stale holds");
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO slot_reservations
                (id, provider_id, start_time, end_time, duration_minutes, client_contact,
                 expires_at, gateway_session_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(reservation.id)
        .bind(reservation.provider_id)
        .bind(reservation.start_time)
        .bind(reservation.end_time())
        .bind(reservation.duration_minutes)
        .bind(reservation.client_contact.expose())
        .bind(reservation.expires_at)
        .bind(reservation.gateway_session_id.as_deref())
        .bind(ReservationStatus::Held.as_str())
        .bind(reservation.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;

        if inserted.rows_affected() == 0 {
            return Ok(HoldOutcome::Conflict);
        }
        Ok(HoldOutcome::Held(reservation.clone()))
    }

    async fn find_reservation(&self, id: Uuid) -> RepositoryResult<Option<SlotReservation>> {
        let row = sqlx::query_as::<_, ReservationRow>(&format!(
            "SELECT {} FROM slot_reservations WHERE id = $1",
            RESERVATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(SlotReservation::try_from).transpose()
    }

    async fn attach_session(&self, id: Uuid, gateway_session_id: &str) -> RepositoryResult<bool> {
        let result = sqlx::query(
            "UPDATE slot_reservations SET gateway_session_id = $2 WHERE id = $1 AND status = 'HELD'",
        )
        .bind(id)
        .bind(gateway_session_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn consume(
        &self,
        id: Uuid,
        gateway_session_id: &str,
        amount: &Money,
        now: DateTime<Utc>,
    ) -> RepositoryResult<ConsumeOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let Some(reservation) = lock_reservation(&mut tx, id).await? else {
            return Ok(ConsumeOutcome::NotFound);
        };
        let foreign_session = reservation
            .gateway_session_id
            .clone()
            .filter(|attached| attached != gateway_session_id);

        let outcome = match reservation.effective_status(now) {
            ReservationStatus::Expired => {
                if reservation.status == ReservationStatus::Held {
                    set_reservation_status(&mut tx, id, ReservationStatus::Expired).await?;
                }
                ConsumeOutcome::Expired
            }
            ReservationStatus::Cancelled => ConsumeOutcome::Cancelled,
            ReservationStatus::Consumed => {
                let meeting = sqlx::query_as::<_, MeetingRow>(&format!(
                    "SELECT {} FROM meetings WHERE reservation_id = $1",
                    MEETING_COLUMNS
                ))
                .bind(id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error)?
                .ok_or_else(|| corrupt(format!("reservation {} consumed without meeting", id)))?;
                ConsumeOutcome::AlreadyConsumed(Meeting::try_from(meeting)?)
            }
            ReservationStatus::Held if foreign_session.is_some() => ConsumeOutcome::SessionMismatch {
                attached: foreign_session.unwrap_or_default(),
            },
            ReservationStatus::Held => {
                sqlx::query(
                    "UPDATE slot_reservations SET status = 'CONSUMED', gateway_session_id = $2 WHERE id = $1",
                )
                .bind(id)
                .bind(gateway_session_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;

                let meeting = Meeting {
                    id: Uuid::new_v4(),
                    reservation_id: id,
                    provider_id: reservation.provider_id,
                    client_contact: reservation.client_contact.clone(),
                    start_time: reservation.start_time,
                    duration_minutes: reservation.duration_minutes,
                    payment_reference: gateway_session_id.to_string(),
                    amount: amount.clone(),
                    status: BookingStatus::Pending,
                    created_at: now,
                    updated_at: now,
                };

                sqlx::query(
                    r#"
                    INSERT INTO meetings
                        (id, reservation_id, provider_id, client_contact, start_time, duration_minutes,
                         payment_reference, amount_minor, currency, status, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    "#,
                )
                .bind(meeting.id)
                .bind(meeting.reservation_id)
                .bind(meeting.provider_id)
                .bind(meeting.client_contact.expose())
                .bind(meeting.start_time)
                .bind(meeting.duration_minutes)
                .bind(&meeting.payment_reference)
                .bind(meeting.amount.amount_minor)
                .bind(&meeting.amount.currency)
                .bind(meeting.status.as_str())
                .bind(meeting.created_at)
                .bind(meeting.updated_at)
                .execute(&mut *tx)
                .await
                .map_err(db_error)?;

                ConsumeOutcome::Consumed(meeting)
            }
        };

        tx.commit().await.map_err(db_error)?;
        Ok(outcome)
    }

    async fn release(&self, id: Uuid, now: DateTime<Utc>) -> RepositoryResult<ReleaseOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let Some(reservation) = lock_reservation(&mut tx, id).await? else {
            return Ok(ReleaseOutcome::NotFound);
        };

        let outcome = match reservation.effective_status(now) {
            ReservationStatus::Held => {
                set_reservation_status(&mut tx, id, ReservationStatus::Cancelled).await?;
                ReleaseOutcome::Released
            }
            other => {
                if other != reservation.status {
                    set_reservation_status(&mut tx, id, other).await?;
                }
                ReleaseOutcome::NotHeld(other)
            }
        };

        tx.commit().await.map_err(db_error)?;
        Ok(outcome)
    }
}

#[async_trait]
impl MeetingRepository for StoreBookingRepository {
    async fn find_meeting(&self, id: Uuid) -> RepositoryResult<Option<Meeting>> {
        let row = sqlx::query_as::<_, MeetingRow>(&format!(
            "SELECT {} FROM meetings WHERE id = $1",
            MEETING_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(Meeting::try_from).transpose()
    }

    async fn find_meeting_by_payment(&self, gateway_session_id: &str) -> RepositoryResult<Option<Meeting>> {
        let row = sqlx::query_as::<_, MeetingRow>(&format!(
            "SELECT {} FROM meetings WHERE payment_reference = $1",
            MEETING_COLUMNS
        ))
        .bind(gateway_session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(Meeting::try_from).transpose()
    }

    async fn update_meeting_status(
        &self,
        id: Uuid,
        status: BookingStatus,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let result = sqlx::query("UPDATE meetings SET status = $2, updated_at = $3 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("meeting {}", id)));
        }
        Ok(())
    }
}
