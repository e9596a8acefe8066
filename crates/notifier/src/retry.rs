//! Delayed re-enqueue of failed deliveries.
//!
//! Each scheduled retry is a tracked task that sleeps for its backoff delay
//! and then puts the item back on the queue. All tasks share the worker's
//! shutdown token: a retry still waiting when shutdown begins is dropped
//! without touching the queue. The outbox row it belongs to stays
//! `Processing` with its recorded attempt count and is returned to `Pending`
//! on the next startup.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::queue::{EmailQueue, EmailQueueItem};

pub struct RetryScheduler {
    queue: Arc<EmailQueue>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl RetryScheduler {
    pub fn new(queue: Arc<EmailQueue>, shutdown: CancellationToken) -> Self {
        Self {
            queue,
            tracker: TaskTracker::new(),
            shutdown,
        }
    }

    /// Re-enqueue `item` after `delay` unless shutdown happens first.
    pub fn schedule(&self, item: EmailQueueItem, delay: Duration) {
        let queue = self.queue.clone();
        let shutdown = self.shutdown.clone();

        self.tracker.spawn(async move {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::debug!(
                        email_id = %item.id,
                        attempt = item.attempt,
                        "Scheduled retry dropped on shutdown"
                    );
                }
                _ = tokio::time::sleep(delay) => {
                    queue.enqueue(item);
                }
            }
        });
    }

    /// Retries currently waiting for their delay.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Stop accepting retries and wait for every scheduled one to finish.
    pub async fn close_and_wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
