//! Email delivery worker.
//!
//! A single consumer drains the [`EmailQueue`] and sends one email at a time.
//! Per item: `Pending → Attempting → {Sent | ScheduledRetry | Abandoned}`.
//!
//! Failed sends are re-enqueued by the [`RetryScheduler`] after a backoff
//! delay, so the drain loop never waits on a retry. When an item came from
//! the outbox, its terminal state is written back to the outbox row.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use quill_outbox::OutboxStore;

use crate::backoff::{self, RetryDecision};
use crate::queue::{EmailQueue, EmailQueueItem};
use crate::retry::RetryScheduler;
use crate::transport::MailTransport;

/// Result of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    ScheduledRetry { next_attempt: u32, delay: Duration },
    Abandoned { attempts: u32 },
}

/// Counters for one worker run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub sent: u64,
    pub retried: u64,
    pub abandoned: u64,
}

pub struct EmailSendWorker {
    queue: Arc<EmailQueue>,
    transport: Arc<dyn MailTransport>,
    outbox: Option<Arc<dyn OutboxStore>>,
}

impl EmailSendWorker {
    pub fn new(queue: Arc<EmailQueue>, transport: Arc<dyn MailTransport>) -> Self {
        Self {
            queue,
            transport,
            outbox: None,
        }
    }

    /// Record terminal outcomes of outbox-backed items in `outbox`.
    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Drain the queue until `shutdown` is cancelled.
    ///
    /// An attempt already in progress when shutdown begins is allowed to
    /// finish; retries still waiting for their delay are dropped.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerReport {
        let retries = RetryScheduler::new(self.queue.clone(), shutdown.clone());
        let mut report = WorkerReport::default();

        tracing::info!(max_attempts = backoff::MAX_ATTEMPTS, "Email send worker started");

        while let Some(item) = self.queue.dequeue(&shutdown).await {
            match self.deliver(item, &retries).await {
                DeliveryOutcome::Sent => report.sent += 1,
                DeliveryOutcome::ScheduledRetry { .. } => report.retried += 1,
                DeliveryOutcome::Abandoned { .. } => report.abandoned += 1,
            }
        }

        let dropped = retries.pending();
        retries.close_and_wait().await;

        tracing::info!(
            sent = report.sent,
            retried = report.retried,
            abandoned = report.abandoned,
            dropped_retries = dropped,
            "Email send worker stopped"
        );
        report
    }

    /// Attempt one delivery and decide what happens next.
    pub async fn deliver(&self, item: EmailQueueItem, retries: &RetryScheduler) -> DeliveryOutcome {
        // A row resumed after repeated restarts may have no budget left.
        if item.attempt >= backoff::MAX_ATTEMPTS {
            let attempts = item.attempt;
            tracing::error!(
                email_id = %item.id,
                to_address = %item.email.to_address,
                attempts,
                "Email delivery abandoned, attempt budget already spent"
            );
            self.record_failed(&item, attempts, "attempt budget exhausted")
                .await;
            return DeliveryOutcome::Abandoned { attempts };
        }

        let error = match self.transport.send(&item.email).await {
            Ok(()) => {
                tracing::info!(
                    email_id = %item.id,
                    to_address = %item.email.to_address,
                    subject = %item.email.subject,
                    attempt = item.attempt + 1,
                    "Email sent"
                );
                self.record_sent(&item).await;
                return DeliveryOutcome::Sent;
            }
            Err(e) => e,
        };

        match backoff::decide(item.attempt) {
            RetryDecision::Abandon { attempts } => {
                tracing::error!(
                    email_id = %item.id,
                    to_address = %item.email.to_address,
                    subject = %item.email.subject,
                    attempts,
                    error = %error,
                    "Email delivery abandoned"
                );
                self.record_failed(&item, attempts, &error.to_string()).await;
                DeliveryOutcome::Abandoned { attempts }
            }
            RetryDecision::Retry {
                next_attempt,
                delay,
            } => {
                tracing::warn!(
                    email_id = %item.id,
                    to_address = %item.email.to_address,
                    subject = %item.email.subject,
                    next_attempt = next_attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Email delivery failed, retry scheduled"
                );
                self.record_attempt(&item, next_attempt, &error.to_string())
                    .await;
                retries.schedule(item.next_attempt(), delay);
                DeliveryOutcome::ScheduledRetry {
                    next_attempt,
                    delay,
                }
            }
        }
    }

    async fn record_sent(&self, item: &EmailQueueItem) {
        let (Some(outbox), Some(outbox_id)) = (&self.outbox, item.outbox_id) else {
            return;
        };
        if let Err(e) = outbox.mark_sent(outbox_id, attempts_made(item.attempt + 1)).await {
            tracing::error!(
                outbox_id = %outbox_id,
                error = %e,
                "Failed to record email delivery"
            );
        }
    }

    async fn record_attempt(&self, item: &EmailQueueItem, attempts: u32, error: &str) {
        let (Some(outbox), Some(outbox_id)) = (&self.outbox, item.outbox_id) else {
            return;
        };
        if let Err(e) = outbox
            .record_attempt(outbox_id, attempts_made(attempts), error)
            .await
        {
            tracing::error!(
                outbox_id = %outbox_id,
                error = %e,
                "Failed to record email delivery attempt"
            );
        }
    }

    async fn record_failed(&self, item: &EmailQueueItem, attempts: u32, error: &str) {
        let (Some(outbox), Some(outbox_id)) = (&self.outbox, item.outbox_id) else {
            return;
        };
        if let Err(e) = outbox
            .mark_failed(outbox_id, attempts_made(attempts), error)
            .await
        {
            tracing::error!(
                outbox_id = %outbox_id,
                error = %e,
                "Failed to record abandoned email"
            );
        }
    }
}

fn attempts_made(attempts: u32) -> i32 {
    i32::try_from(attempts).unwrap_or(i32::MAX)
}
