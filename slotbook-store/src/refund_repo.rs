use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use slotbook_core::repository::RefundRepository;
use slotbook_core::{Money, RefundRecord, RefundStatus, RepositoryError, RepositoryResult};

use crate::database::{corrupt, db_error};

/// Refund backlog. `gateway_session_id` is unique, so a session is refunded at most once.
pub struct StoreRefundRepository {
    pool: PgPool,
}

impl StoreRefundRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct RefundRow {
    id: Uuid,
    gateway_session_id: String,
    reservation_id: Uuid,
    amount_minor: i64,
    currency: String,
    reason: String,
    status: String,
    attempts: i32,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    gateway_refund_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RefundRow> for RefundRecord {
    type Error = RepositoryError;

    fn try_from(row: RefundRow) -> Result<Self, Self::Error> {
        Ok(RefundRecord {
            id: row.id,
            gateway_session_id: row.gateway_session_id,
            reservation_id: row.reservation_id,
            amount: Money::new(row.amount_minor, row.currency),
            reason: row.reason,
            status: row.status.parse().map_err(corrupt)?,
            attempts: row.attempts,
            next_attempt_at: row.next_attempt_at,
            last_error: row.last_error,
            gateway_refund_id: row.gateway_refund_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const REFUND_COLUMNS: &str = "id, gateway_session_id, reservation_id, amount_minor, currency, reason, \
     status, attempts, next_attempt_at, last_error, gateway_refund_id, created_at, updated_at";

impl StoreRefundRepository {
    async fn fetch_many(&self, sql: &str, now: Option<(DateTime<Utc>, i64)>) -> RepositoryResult<Vec<RefundRecord>> {
        let query = sqlx::query_as::<_, RefundRow>(sql);
        let query = match now {
            Some((now, limit)) => query.bind(now).bind(limit),
            None => query,
        };
        let rows = query.fetch_all(&self.pool).await.map_err(db_error)?;
        rows.into_iter().map(RefundRecord::try_from).collect()
    }
}

#[async_trait]
impl RefundRepository for StoreRefundRepository {
    async fn find_refund(&self, gateway_session_id: &str) -> RepositoryResult<Option<RefundRecord>> {
        let row = sqlx::query_as::<_, RefundRow>(&format!(
            "SELECT {} FROM refunds WHERE gateway_session_id = $1",
            REFUND_COLUMNS
        ))
        .bind(gateway_session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(RefundRecord::try_from).transpose()
    }

    async fn insert_refund(&self, record: &RefundRecord) -> RepositoryResult<RefundRecord> {
        sqlx::query(
            r#"
            INSERT INTO refunds
                (id, gateway_session_id, reservation_id, amount_minor, currency, reason, status,
                 attempts, next_attempt_at, last_error, gateway_refund_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (gateway_session_id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(&record.gateway_session_id)
        .bind(record.reservation_id)
        .bind(record.amount.amount_minor)
        .bind(&record.amount.currency)
        .bind(&record.reason)
        .bind(record.status.as_str())
        .bind(record.attempts)
        .bind(record.next_attempt_at)
        .bind(record.last_error.as_deref())
        .bind(record.gateway_refund_id.as_deref())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        self.find_refund(&record.gateway_session_id)
            .await?
            .ok_or_else(|| RepositoryError::NotFound(format!("refund for {}", record.gateway_session_id)))
    }

    async fn claim_refund(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE refunds SET next_attempt_at = $3, last_error = NULL, updated_at = $2
            WHERE id = $1 AND status = 'PENDING' AND next_attempt_at <= $2
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(lease_until)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn expedite_refund(&self, id: Uuid, now: DateTime<Utc>) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE refunds SET next_attempt_at = $2, updated_at = $2
            WHERE id = $1 AND status = 'PENDING' AND last_error IS NOT NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_refund_issued(
        &self,
        id: Uuid,
        gateway_refund_id: &str,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE refunds
            SET status = $2, attempts = attempts + 1, gateway_refund_id = $3, last_error = NULL, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(RefundStatus::Issued.as_str())
        .bind(gateway_refund_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("refund {}", id)));
        }
        Ok(())
    }

    async fn record_refund_failure(
        &self,
        id: Uuid,
        error: &str,
        next_attempt_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> RepositoryResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE refunds
            SET attempts = attempts + 1, last_error = $2, next_attempt_at = $3, updated_at = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(next_attempt_at)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("refund {}", id)));
        }
        Ok(())
    }

    async fn list_pending_refunds(&self) -> RepositoryResult<Vec<RefundRecord>> {
        self.fetch_many(
            &format!(
                "SELECT {} FROM refunds WHERE status = 'PENDING' ORDER BY created_at",
                REFUND_COLUMNS
            ),
            None,
        )
        .await
    }

    async fn list_due_refunds(&self, now: DateTime<Utc>, limit: i64) -> RepositoryResult<Vec<RefundRecord>> {
        self.fetch_many(
            &format!(
                "SELECT {} FROM refunds WHERE status = 'PENDING' AND next_attempt_at <= $1 \
                 ORDER BY next_attempt_at LIMIT $2",
                REFUND_COLUMNS
            ),
            Some((now, limit)),
        )
        .await
    }
}
