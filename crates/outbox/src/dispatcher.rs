//! Outbox dispatcher: turns pending rows into handler invocations.
//!
//! For each pending row, oldest first:
//! 1. Resolve the handler for the row's task type (a miss is fatal)
//! 2. Claim the row (`Pending` → `Processing`)
//! 3. Invoke the handler and record the outcome
//!
//! The dispatcher never retries. A handler that needs retries owns them,
//! which is how email delivery works: its handler hands the row off to the
//! delivery worker and the worker records the terminal state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use quill_common::error::AppError;
use quill_common::types::{OutboxMessage, TaskKind};

use crate::store::OutboxStore;

/// What a handler did with a claimed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The side effect is done; the dispatcher marks the row `Sent`.
    Completed,
    /// Another component now owns the row and records its terminal state.
    HandedOff,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("Handler failed: {0}")]
    Failed(String),
}

/// Fatal dispatch errors. Handler failures are not in here: they are
/// recorded on the row and dispatching continues.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Outbox store error: {0}")]
    Store(#[from] AppError),

    #[error("Unknown outbox task type '{0}'")]
    UnknownTaskType(String),

    #[error("No handler registered for task type '{0}'")]
    UnregisteredHandler(TaskKind),

    #[error("A handler for task type '{0}' is already registered")]
    DuplicateHandler(TaskKind),
}

/// Executes one kind of outbox task.
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    fn kind(&self) -> TaskKind;

    async fn handle(&self, message: &OutboxMessage) -> Result<HandleOutcome, HandlerError>;
}

/// Task type → handler table, built once at startup.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn OutboxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Exactly one handler may exist per task kind.
    pub fn register(&mut self, handler: Arc<dyn OutboxHandler>) -> Result<(), DispatchError> {
        let kind = handler.kind();
        if self.handlers.contains_key(&kind) {
            return Err(DispatchError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, handler);
        tracing::debug!(task_type = %kind, "Outbox handler registered");
        Ok(())
    }

    pub fn with(mut self, handler: Arc<dyn OutboxHandler>) -> Result<Self, DispatchError> {
        self.register(handler)?;
        Ok(self)
    }

    pub fn resolve(&self, message_type: &str) -> Result<&Arc<dyn OutboxHandler>, DispatchError> {
        let kind: TaskKind = message_type
            .parse()
            .map_err(|_| DispatchError::UnknownTaskType(message_type.to_string()))?;
        self.handlers
            .get(&kind)
            .ok_or(DispatchError::UnregisteredHandler(kind))
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Counters for one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub completed: u32,
    pub handed_off: u32,
    pub failed: u32,
    /// Rows another dispatcher claimed first.
    pub skipped: u32,
}

impl DispatchReport {
    pub fn total(&self) -> u32 {
        self.completed + self.handed_off + self.failed
    }
}

pub struct OutboxDispatcher {
    store: Arc<dyn OutboxStore>,
    registry: HandlerRegistry,
    batch_size: i64,
    poll_interval: Duration,
}

impl OutboxDispatcher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        registry: HandlerRegistry,
        batch_size: i64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            batch_size,
            poll_interval,
        }
    }

    /// Process one batch of pending rows.
    pub async fn dispatch_pending(&self) -> Result<DispatchReport, DispatchError> {
        let pending = self.store.fetch_pending(self.batch_size).await?;
        let mut report = DispatchReport::default();

        for message in &pending {
            // Resolve before claiming so a misconfigured type leaves the row pending.
            let handler = self.registry.resolve(&message.message_type)?;

            let Some(claimed) = self.store.claim(message.id).await? else {
                report.skipped += 1;
                continue;
            };

            match handler.handle(&claimed).await {
                Ok(HandleOutcome::Completed) => {
                    self.store.mark_sent(claimed.id, claimed.attempt).await?;
                    report.completed += 1;
                }
                Ok(HandleOutcome::HandedOff) => {
                    tracing::debug!(
                        outbox_id = %claimed.id,
                        message_type = %claimed.message_type,
                        "Outbox message handed off"
                    );
                    report.handed_off += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        outbox_id = %claimed.id,
                        message_type = %claimed.message_type,
                        attempt = claimed.attempt,
                        error = %e,
                        "Outbox handler failed"
                    );
                    self.store
                        .mark_failed(claimed.id, claimed.attempt, &e.to_string())
                        .await?;
                    report.failed += 1;
                }
            }
        }

        if report.total() > 0 {
            tracing::info!(
                completed = report.completed,
                handed_off = report.handed_off,
                failed = report.failed,
                "Outbox dispatch pass finished"
            );
        }

        Ok(report)
    }

    /// Poll for pending rows until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DispatchError> {
        tracing::info!(
            handlers = self.registry.len(),
            batch_size = self.batch_size,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Outbox dispatcher started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let report = self.dispatch_pending().await?;

            // A full batch means more work is probably waiting.
            let fetched = i64::from(report.total() + report.skipped);
            if self.batch_size > 0 && fetched >= self.batch_size {
                continue;
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        tracing::info!("Outbox dispatcher stopped");
        Ok(())
    }
}
