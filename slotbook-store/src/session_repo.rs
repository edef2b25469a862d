use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use slotbook_core::repository::PaymentSessionRepository;
use slotbook_core::{Money, PaymentSession, RepositoryError, RepositoryResult, SettlementState};

use crate::database::{corrupt, db_error};

pub struct StoreSessionRepository {
    pool: PgPool,
}

impl StoreSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    gateway_session_id: String,
    reservation_id: Uuid,
    state: String,
    amount_minor: i64,
    currency: String,
    continuation: Option<Value>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for PaymentSession {
    type Error = RepositoryError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(PaymentSession {
            gateway_session_id: row.gateway_session_id,
            reservation_id: row.reservation_id,
            state: row.state.parse().map_err(corrupt)?,
            amount: Money::new(row.amount_minor, row.currency),
            continuation: row.continuation,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[async_trait]
impl PaymentSessionRepository for StoreSessionRepository {
    async fn create_session(&self, session: &PaymentSession) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO payment_sessions
                (gateway_session_id, reservation_id, state, amount_minor, currency, continuation, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (gateway_session_id) DO NOTHING
            "#,
        )
        .bind(&session.gateway_session_id)
        .bind(session.reservation_id)
        .bind(session.state.as_str())
        .bind(session.amount.amount_minor)
        .bind(&session.amount.currency)
        .bind(session.continuation.clone())
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn find_session(&self, gateway_session_id: &str) -> RepositoryResult<Option<PaymentSession>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT gateway_session_id, reservation_id, state, amount_minor, currency, continuation, created_at, updated_at
            FROM payment_sessions WHERE gateway_session_id = $1
            "#,
        )
        .bind(gateway_session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(PaymentSession::try_from).transpose()
    }

    async fn transition_session(
        &self,
        gateway_session_id: &str,
        from: SettlementState,
        to: SettlementState,
        continuation: Option<&Value>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_sessions
            SET state = $3, continuation = COALESCE($4, continuation), updated_at = $5
            WHERE gateway_session_id = $1 AND state = $2
            "#,
        )
        .bind(gateway_session_id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(continuation.cloned())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }
}
