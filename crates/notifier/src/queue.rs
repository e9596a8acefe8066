//! In-memory email delivery queue.
//!
//! Many producers (the outbox handler, direct in-process senders, delayed
//! retry tasks) push items; exactly one worker pulls them. Items are buffered
//! without bound and each push releases one semaphore permit, so the consumer
//! sleeps until there is work instead of polling.
//!
//! Permits and queued items may briefly disagree under concurrent drains.
//! The consumer reconciles by waiting again when a permit finds the queue
//! empty.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use quill_common::types::EmailPayload;

/// One delivery attempt waiting in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailQueueItem {
    pub id: Uuid,
    /// The outbox row this item delivers, if it came from the outbox.
    pub outbox_id: Option<Uuid>,
    pub email: EmailPayload,
    /// Zero-based attempt number.
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

impl EmailQueueItem {
    pub fn new(email: EmailPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbox_id: None,
            email,
            attempt: 0,
            enqueued_at: Utc::now(),
        }
    }

    pub fn from_outbox(outbox_id: Uuid, email: EmailPayload) -> Self {
        Self {
            outbox_id: Some(outbox_id),
            ..Self::new(email)
        }
    }

    /// Resume counting from `attempts_made` earlier attempts.
    pub fn with_attempt(mut self, attempts_made: u32) -> Self {
        self.attempt = attempts_made;
        self
    }

    /// The item for the next attempt: same identity, attempt + 1.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            enqueued_at: Utc::now(),
            ..self.clone()
        }
    }
}

pub struct EmailQueue {
    items: Mutex<VecDeque<EmailQueueItem>>,
    signal: Semaphore,
}

impl EmailQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            signal: Semaphore::new(0),
        }
    }

    /// Append an item and wake the consumer. Never blocks.
    pub fn enqueue(&self, item: EmailQueueItem) {
        tracing::debug!(
            email_id = %item.id,
            to_address = %item.email.to_address,
            subject = %item.email.subject,
            attempt = item.attempt,
            "Email queued"
        );
        self.items.lock().push_back(item);
        self.signal.add_permits(1);
    }

    /// Queue an email that did not come from the outbox.
    pub fn enqueue_email(&self, email: EmailPayload) -> EmailQueueItem {
        let item = EmailQueueItem::new(email);
        self.enqueue(item.clone());
        item
    }

    /// Wait for the next item. Returns `None` once `shutdown` is cancelled.
    pub async fn dequeue(&self, shutdown: &CancellationToken) -> Option<EmailQueueItem> {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                permit = self.signal.acquire() => match permit {
                    Ok(permit) => permit.forget(),
                    Err(_) => return None,
                },
            }

            if let Some(item) = self.items.lock().pop_front() {
                return Some(item);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl Default for EmailQueue {
    fn default() -> Self {
        Self::new()
    }
}
