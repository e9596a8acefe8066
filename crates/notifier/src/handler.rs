//! Outbox handler for `email.send` rows.

use std::sync::Arc;

use async_trait::async_trait;

use quill_common::types::{EmailPayload, OutboxMessage, TaskKind};
use quill_outbox::{HandleOutcome, HandlerError, OutboxHandler};

use crate::queue::{EmailQueue, EmailQueueItem};

/// Moves email rows onto the delivery queue. Retries and the terminal
/// outbox state belong to the worker, so the row is handed off.
pub struct EmailSendHandler {
    queue: Arc<EmailQueue>,
}

impl EmailSendHandler {
    pub fn new(queue: Arc<EmailQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl OutboxHandler for EmailSendHandler {
    fn kind(&self) -> TaskKind {
        TaskKind::EmailSend
    }

    async fn handle(&self, message: &OutboxMessage) -> Result<HandleOutcome, HandlerError> {
        let email: EmailPayload = serde_json::from_value(message.payload.clone())?;
        // The claim already counted the attempt about to be made.
        let attempts_made = u32::try_from(message.attempt.saturating_sub(1)).unwrap_or(0);
        self.queue
            .enqueue(EmailQueueItem::from_outbox(message.id, email).with_attempt(attempts_made));
        Ok(HandleOutcome::HandedOff)
    }
}
