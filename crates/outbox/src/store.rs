//! Outbox persistence.
//!
//! Enqueue is an upsert-or-skip: a request carrying a dedup key that already
//! exists for the same message type returns the stored row untouched. The
//! PostgreSQL implementation relies on a partial unique index so concurrent
//! duplicate enqueues are resolved by the database, not by a read-then-write.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use quill_common::error::AppError;
use quill_common::types::{EmailPayload, OutboxMessage, OutboxStatus, TaskKind};

/// A request to persist a new unit of work.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub message_type: String,
    pub payload: serde_json::Value,
    pub dedup_key: Option<String>,
}

impl EnqueueRequest {
    pub fn new(kind: TaskKind, payload: serde_json::Value, dedup_key: Option<String>) -> Self {
        Self {
            message_type: kind.to_string(),
            payload,
            dedup_key,
        }
    }

    /// Build an `email.send` request.
    pub fn email(payload: &EmailPayload, dedup_key: Option<String>) -> Result<Self, AppError> {
        Ok(Self::new(
            TaskKind::EmailSend,
            serde_json::to_value(payload)?,
            dedup_key,
        ))
    }
}

/// Durable, idempotent task persistence.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a new `Pending` row, or return the existing row for the same
    /// `(message_type, dedup_key)` without modifying it.
    async fn enqueue(&self, request: EnqueueRequest) -> Result<OutboxMessage, AppError>;

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, AppError>;

    /// Pending rows in creation order, oldest first.
    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>, AppError>;

    /// Move a row from `Pending` to `Processing` and count the attempt.
    /// Returns `None` when the row is no longer pending.
    async fn claim(&self, id: Uuid) -> Result<Option<OutboxMessage>, AppError>;

    async fn mark_sent(&self, id: Uuid, attempt: i32) -> Result<(), AppError>;

    async fn mark_failed(&self, id: Uuid, attempt: i32, error: &str) -> Result<(), AppError>;

    /// Persist the attempt count and last error of a `Processing` row that
    /// will be retried, so a restart resumes from the same count.
    async fn record_attempt(&self, id: Uuid, attempt: i32, error: &str) -> Result<(), AppError>;

    /// Return every `Processing` row to `Pending`. Only valid while no
    /// dispatcher or worker is running, e.g. at startup.
    async fn recover_in_flight(&self) -> Result<u64, AppError>;
}

/// PostgreSQL-backed outbox store.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn find_by_dedup_key(
        &self,
        message_type: &str,
        dedup_key: &str,
    ) -> Result<Option<OutboxMessage>, AppError> {
        let row: Option<OutboxMessage> = sqlx::query_as(
            "SELECT * FROM outbox_messages WHERE message_type = $1 AND dedup_key = $2",
        )
        .bind(message_type)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn finish(
        &self,
        id: Uuid,
        status: OutboxStatus,
        attempt: i32,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = $2, attempt = $3, last_error = $4, last_attempt_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.to_string())
        .bind(attempt)
        .bind(error)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Outbox message {} not found", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<OutboxMessage, AppError> {
        let inserted: Option<OutboxMessage> = sqlx::query_as(
            r#"
            INSERT INTO outbox_messages (id, message_type, payload, dedup_key, status, attempt, created_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            ON CONFLICT (message_type, dedup_key) WHERE dedup_key IS NOT NULL DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&request.message_type)
        .bind(&request.payload)
        .bind(&request.dedup_key)
        .bind(OutboxStatus::Pending.to_string())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(message) = inserted {
            tracing::info!(
                outbox_id = %message.id,
                message_type = %message.message_type,
                dedup_key = ?message.dedup_key,
                "Outbox message enqueued"
            );
            return Ok(message);
        }

        // Conflict: only possible when a dedup key was supplied.
        let dedup_key = request.dedup_key.as_deref().unwrap_or_default();
        let existing = self
            .find_by_dedup_key(&request.message_type, dedup_key)
            .await?
            .ok_or_else(|| {
                AppError::Internal(format!(
                    "Outbox conflict on '{}' but no row found",
                    dedup_key
                ))
            })?;

        tracing::debug!(
            outbox_id = %existing.id,
            dedup_key,
            "Outbox enqueue skipped, dedup key already present"
        );
        Ok(existing)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, AppError> {
        let row: Option<OutboxMessage> =
            sqlx::query_as("SELECT * FROM outbox_messages WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row)
    }

    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>, AppError> {
        let rows: Vec<OutboxMessage> = sqlx::query_as(
            r#"
            SELECT * FROM outbox_messages
            WHERE status = $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
        )
        .bind(OutboxStatus::Pending.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn claim(&self, id: Uuid) -> Result<Option<OutboxMessage>, AppError> {
        let row: Option<OutboxMessage> = sqlx::query_as(
            r#"
            UPDATE outbox_messages
            SET status = $2, attempt = attempt + 1, last_attempt_at = $3
            WHERE id = $1 AND status = $4
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(OutboxStatus::Processing.to_string())
        .bind(Utc::now())
        .bind(OutboxStatus::Pending.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn mark_sent(&self, id: Uuid, attempt: i32) -> Result<(), AppError> {
        self.finish(id, OutboxStatus::Sent, attempt, None).await
    }

    async fn mark_failed(&self, id: Uuid, attempt: i32, error: &str) -> Result<(), AppError> {
        self.finish(id, OutboxStatus::Failed, attempt, Some(error))
            .await
    }

    async fn record_attempt(&self, id: Uuid, attempt: i32, error: &str) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET attempt = $2, last_error = $3, last_attempt_at = $4
            WHERE id = $1 AND status = $5
            "#,
        )
        .bind(id)
        .bind(attempt)
        .bind(error)
        .bind(Utc::now())
        .bind(OutboxStatus::Processing.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!(
                "Outbox message {} not found in processing state",
                id
            )));
        }
        Ok(())
    }

    async fn recover_in_flight(&self) -> Result<u64, AppError> {
        let result = sqlx::query("UPDATE outbox_messages SET status = $1 WHERE status = $2")
            .bind(OutboxStatus::Pending.to_string())
            .bind(OutboxStatus::Processing.to_string())
            .execute(&self.pool)
            .await?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::info!(recovered, "Returned in-flight outbox messages to pending");
        }
        Ok(recovered)
    }
}
