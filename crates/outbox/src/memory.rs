//! In-process outbox store.
//!
//! Holds rows in insertion order behind a single mutex, so the dedup check and
//! the insert happen atomically. Used by tests and by embedders that do not
//! need durability across restarts.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use quill_common::error::AppError;
use quill_common::types::{OutboxMessage, OutboxStatus};

use crate::store::{EnqueueRequest, OutboxStore};

#[derive(Default)]
pub struct MemoryOutboxStore {
    rows: Mutex<Vec<OutboxMessage>>,
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row, in insertion order.
    pub fn all(&self) -> Vec<OutboxMessage> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    fn finish(
        &self,
        id: Uuid,
        status: OutboxStatus,
        attempt: i32,
        error: Option<&str>,
    ) -> Result<(), AppError> {
        let mut rows = self.rows.lock();
        let row = rows
            .iter_mut()
            .find(|row| row.id == id)
            .ok_or_else(|| AppError::NotFound(format!("Outbox message {} not found", id)))?;

        row.status = status;
        row.attempt = attempt;
        row.last_error = error.map(str::to_string);
        row.last_attempt_at = Some(Utc::now());
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<OutboxMessage, AppError> {
        let mut rows = self.rows.lock();

        if let Some(key) = request.dedup_key.as_deref()
            && let Some(existing) = rows.iter().find(|row| {
                row.message_type == request.message_type && row.dedup_key.as_deref() == Some(key)
            })
        {
            tracing::debug!(
                outbox_id = %existing.id,
                dedup_key = key,
                "Outbox enqueue skipped, dedup key already present"
            );
            return Ok(existing.clone());
        }

        let message = OutboxMessage {
            id: Uuid::new_v4(),
            message_type: request.message_type,
            payload: request.payload,
            dedup_key: request.dedup_key,
            status: OutboxStatus::Pending,
            attempt: 0,
            last_error: None,
            created_at: Utc::now(),
            last_attempt_at: None,
        };
        rows.push(message.clone());

        tracing::info!(
            outbox_id = %message.id,
            message_type = %message.message_type,
            "Outbox message enqueued"
        );
        Ok(message)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>, AppError> {
        Ok(self.rows.lock().iter().find(|row| row.id == id).cloned())
    }

    async fn fetch_pending(&self, limit: i64) -> Result<Vec<OutboxMessage>, AppError> {
        let limit = usize::try_from(limit).unwrap_or(0);
        // Insertion order is creation order.
        Ok(self
            .rows
            .lock()
            .iter()
            .filter(|row| row.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn claim(&self, id: Uuid) -> Result<Option<OutboxMessage>, AppError> {
        let mut rows = self.rows.lock();
        let Some(row) = rows
            .iter_mut()
            .find(|row| row.id == id && row.status == OutboxStatus::Pending)
        else {
            return Ok(None);
        };

        row.status = OutboxStatus::Processing;
        row.attempt += 1;
        row.last_attempt_at = Some(Utc::now());
        Ok(Some(row.clone()))
    }

    async fn mark_sent(&self, id: Uuid, attempt: i32) -> Result<(), AppError> {
        self.finish(id, OutboxStatus::Sent, attempt, None)
    }

    async fn mark_failed(&self, id: Uuid, attempt: i32, error: &str) -> Result<(), AppError> {
        self.finish(id, OutboxStatus::Failed, attempt, Some(error))
    }

    async fn record_attempt(&self, id: Uuid, attempt: i32, error: &str) -> Result<(), AppError> {
        let mut rows = self.rows.lock();
        let row = rows
            .iter_mut()
            .find(|row| row.id == id && row.status == OutboxStatus::Processing)
            .ok_or_else(|| {
                AppError::NotFound(format!(
                    "Outbox message {} not found in processing state",
                    id
                ))
            })?;

        row.attempt = attempt;
        row.last_error = Some(error.to_string());
        row.last_attempt_at = Some(Utc::now());
        Ok(())
    }

    async fn recover_in_flight(&self) -> Result<u64, AppError> {
        let mut recovered = 0u64;
        for row in self.rows.lock().iter_mut() {
            if row.status == OutboxStatus::Processing {
                row.status = OutboxStatus::Pending;
                recovered += 1;
            }
        }
        Ok(recovered)
    }
}
