//! Delivery worker scenarios against an in-memory outbox.
//!
//! Time is paused, so the backoff delays between attempts are observed
//! exactly and the tests finish immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use quill_common::types::{EmailPayload, OutboxStatus};
use quill_notifier::backoff::{self, MAX_ATTEMPTS, MAX_JITTER_MS};
use quill_notifier::handler::EmailSendHandler;
use quill_notifier::queue::{EmailQueue, EmailQueueItem};
use quill_notifier::retry::RetryScheduler;
use quill_notifier::transport::{MailTransport, TransportError};
use quill_notifier::worker::{DeliveryOutcome, EmailSendWorker, WorkerReport};
use quill_outbox::{
    EnqueueRequest, HandlerRegistry, MemoryOutboxStore, OutboxDispatcher, OutboxStore,
};

// ============================================================
// Scripted transport
// ============================================================

/// Fails the first `failures` sends to an address, then succeeds.
/// Addresses listed in `always_fail` never succeed.
struct ScriptedTransport {
    failures: u32,
    always_fail: Vec<String>,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedTransport {
    fn failing_first(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            always_fail: Vec::new(),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn always_failing(address: &str) -> Arc<Self> {
        Arc::new(Self {
            failures: 0,
            always_fail: vec![address.to_string()],
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls_to(&self, address: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .iter()
            .filter(|(to, _)| to == address)
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    async fn send(&self, email: &EmailPayload) -> Result<(), TransportError> {
        let previous = {
            let mut calls = self.calls.lock();
            let previous = calls.iter().filter(|(to, _)| *to == email.to_address).count();
            calls.push((email.to_address.clone(), Instant::now()));
            previous as u32
        };

        if self.always_fail.contains(&email.to_address) || previous < self.failures {
            return Err(TransportError::Rejected {
                status: 503,
                body: "provider unavailable".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================
// Helpers
// ============================================================

fn email(address: &str) -> EmailPayload {
    EmailPayload {
        subject: "[StarBlog] Your comment on \"Hello\" received a reply".to_string(),
        html_body: "<p>reply</p>".to_string(),
        to_name: "Parent".to_string(),
        to_address: address.to_string(),
    }
}

struct Pipeline {
    store: Arc<MemoryOutboxStore>,
    queue: Arc<EmailQueue>,
    dispatcher: OutboxDispatcher,
    shutdown: CancellationToken,
    worker: JoinHandle<WorkerReport>,
}

fn pipeline(transport: Arc<ScriptedTransport>) -> Pipeline {
    pipeline_with(Arc::new(MemoryOutboxStore::new()), transport)
}

/// A fresh dispatcher and worker over an existing store, as after a restart.
fn pipeline_with(store: Arc<MemoryOutboxStore>, transport: Arc<ScriptedTransport>) -> Pipeline {
    let queue = Arc::new(EmailQueue::new());
    let registry = HandlerRegistry::new()
        .with(Arc::new(EmailSendHandler::new(queue.clone())))
        .unwrap();
    let dispatcher =
        OutboxDispatcher::new(store.clone(), registry, 50, Duration::from_millis(1000));

    let worker = EmailSendWorker::new(queue.clone(), transport).with_outbox(store.clone());
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let worker = tokio::spawn(async move { worker.run(token).await });

    Pipeline {
        store,
        queue,
        dispatcher,
        shutdown,
        worker,
    }
}

impl Pipeline {
    async fn submit(&self, address: &str, dedup_key: &str) -> uuid::Uuid {
        let request = EnqueueRequest::email(&email(address), Some(dedup_key.to_string())).unwrap();
        let row = self.store.enqueue(request).await.unwrap();
        self.dispatcher.dispatch_pending().await.unwrap();
        row.id
    }

    async fn stop(self) -> (Arc<MemoryOutboxStore>, Arc<EmailQueue>, WorkerReport) {
        self.shutdown.cancel();
        let report = self.worker.await.unwrap();
        (self.store, self.queue, report)
    }
}

fn assert_backoff_gaps(calls: &[Instant]) {
    for (i, pair) in calls.windows(2).enumerate() {
        let gap = pair[1] - pair[0];
        let base = backoff::base_delay(i as u32 + 1);
        assert!(gap >= base, "gap {} was {:?}, expected at least {:?}", i, gap, base);
        assert!(
            gap <= base + Duration::from_millis(MAX_JITTER_MS),
            "gap {} was {:?}, expected at most {:?} plus jitter",
            i,
            gap,
            base
        );
    }
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test(start_paused = true)]
async fn test_first_attempt_success_marks_row_sent() {
    let transport = ScriptedTransport::failing_first(0);
    let pipeline = pipeline(transport.clone());

    let id = pipeline.submit("parent@x", "comment-reply:c1").await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (store, queue, report) = pipeline.stop().await;
    assert_eq!(
        report,
        WorkerReport {
            sent: 1,
            retried: 0,
            abandoned: 0
        }
    );
    assert_eq!(transport.calls_to("parent@x").len(), 1);
    assert!(queue.is_empty());

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Sent);
    assert_eq!(row.attempt, 1);
    assert!(row.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_abandons_after_five_attempts() {
    let transport = ScriptedTransport::always_failing("parent@x");
    let pipeline = pipeline(transport.clone());

    let id = pipeline.submit("parent@x", "comment-reply:c1").await;
    // 2 + 4 + 8 + 16 seconds of backoff plus jitter, with plenty to spare.
    tokio::time::sleep(Duration::from_secs(3600)).await;

    let (store, _queue, report) = pipeline.stop().await;
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.retried, u64::from(MAX_ATTEMPTS - 1));
    assert_eq!(report.sent, 0);

    let calls = transport.calls_to("parent@x");
    assert_eq!(calls.len(), MAX_ATTEMPTS as usize);
    assert_backoff_gaps(&calls);

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.attempt, 5);
    assert!(row.last_error.unwrap().contains("503"));
}

#[tokio::test(start_paused = true)]
async fn test_success_on_last_attempt() {
    let transport = ScriptedTransport::failing_first(4);
    let pipeline = pipeline(transport.clone());

    let id = pipeline.submit("parent@x", "comment-reply:c1").await;
    tokio::time::sleep(Duration::from_secs(3600)).await;

    let (store, _queue, report) = pipeline.stop().await;
    assert_eq!(
        report,
        WorkerReport {
            sent: 1,
            retried: 4,
            abandoned: 0
        }
    );

    let calls = transport.calls_to("parent@x");
    assert_eq!(calls.len(), 5);
    assert_backoff_gaps(&calls);

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Sent);
    assert_eq!(row.attempt, 5);
}

#[tokio::test(start_paused = true)]
async fn test_failing_item_does_not_block_others() {
    let transport = ScriptedTransport::always_failing("broken@x");
    let pipeline = pipeline(transport.clone());

    let broken = pipeline.submit("broken@x", "comment-reply:c1").await;
    let healthy = pipeline.submit("parent@x", "comment-reply:c2").await;

    // Well inside the first 2 s backoff window of the broken item.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.calls_to("parent@x").len(), 1);
    assert_eq!(transport.calls_to("broken@x").len(), 1);

    let row = pipeline.store.get(healthy).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Sent);
    let row = pipeline.store.get(broken).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Processing);

    pipeline.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drops_waiting_retry_and_restart_recovers_row() {
    let transport = ScriptedTransport::failing_first(1);
    let pipeline = pipeline(transport.clone());

    let id = pipeline.submit("parent@x", "comment-reply:c1").await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(transport.calls_to("parent@x").len(), 1);

    let (store, queue, report) = pipeline.stop().await;
    assert_eq!(report.retried, 1);
    assert_eq!(report.sent, 0);

    // The retry never fired.
    tokio::time::sleep(Duration::from_secs(3600)).await;
    assert!(queue.is_empty());
    assert_eq!(transport.calls_to("parent@x").len(), 1);

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Processing);
    assert_eq!(row.attempt, 1);

    assert_eq!(store.recover_in_flight().await.unwrap(), 1);
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_submission_sends_once() {
    let transport = ScriptedTransport::failing_first(0);
    let pipeline = pipeline(transport.clone());

    let first = pipeline.submit("parent@x", "comment-reply:c1").await;
    let second = pipeline.submit("parent@x", "comment-reply:c1").await;
    assert_eq!(first, second);

    tokio::time::sleep(Duration::from_secs(1)).await;
    let (store, _queue, report) = pipeline.stop().await;

    assert_eq!(report.sent, 1);
    assert_eq!(transport.calls_to("parent@x").len(), 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_direct_enqueue_without_outbox_row() {
    let transport = ScriptedTransport::failing_first(0);
    let pipeline = pipeline(transport.clone());

    let item = pipeline.queue.enqueue_email(email("admin@x"));
    assert_eq!(item.attempt, 0);
    assert!(item.outbox_id.is_none());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let (store, _queue, report) = pipeline.stop().await;

    assert_eq!(report.sent, 1);
    assert!(store.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fourth_failure_is_recorded_as_attempt_four() {
    let transport = ScriptedTransport::failing_first(4);
    let store = Arc::new(MemoryOutboxStore::new());
    let queue = Arc::new(EmailQueue::new());
    let row = store
        .enqueue(EnqueueRequest::email(&email("parent@x"), None).unwrap())
        .await
        .unwrap();
    let claimed = store.claim(row.id).await.unwrap().unwrap();

    let worker = EmailSendWorker::new(queue.clone(), transport.clone()).with_outbox(store.clone());
    let shutdown = CancellationToken::new();
    let retries = RetryScheduler::new(queue.clone(), shutdown.clone());

    let mut item = EmailQueueItem::from_outbox(claimed.id, email("parent@x"));
    for failed in 1..=4u32 {
        match worker.deliver(item.clone(), &retries).await {
            DeliveryOutcome::ScheduledRetry { next_attempt, .. } => {
                assert_eq!(next_attempt, failed)
            }
            other => panic!("failure {} should retry, got {:?}", failed, other),
        }
        let row = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(row.status, OutboxStatus::Processing);
        assert_eq!(row.attempt, failed as i32);
        item = item.next_attempt();
    }

    assert_eq!(item.attempt, 4);
    assert_eq!(worker.deliver(item, &retries).await, DeliveryOutcome::Sent);

    let row = store.get(row.id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Sent);
    assert_eq!(row.attempt, 5);

    shutdown.cancel();
    retries.close_and_wait().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_resumes_attempt_count() {
    let transport = ScriptedTransport::always_failing("parent@x");
    let first = pipeline(transport.clone());

    let id = first.submit("parent@x", "comment-reply:c1").await;
    // Sends near 0 s, 2 s and 6 s; the fourth is not due before 14 s.
    tokio::time::sleep(Duration::from_secs(10)).await;

    let (store, _queue, _report) = first.stop().await;
    assert_eq!(transport.calls_to("parent@x").len(), 3);
    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Processing);
    assert_eq!(row.attempt, 3);

    assert_eq!(store.recover_in_flight().await.unwrap(), 1);
    let second = pipeline_with(store, transport.clone());
    second.dispatcher.dispatch_pending().await.unwrap();
    tokio::time::sleep(Duration::from_secs(3600)).await;

    let (store, _queue, report) = second.stop().await;
    assert_eq!(report.abandoned, 1);
    assert_eq!(transport.calls_to("parent@x").len(), MAX_ATTEMPTS as usize);

    let row = store.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.attempt, 5);
}

#[tokio::test(start_paused = true)]
async fn test_row_with_spent_budget_is_abandoned_without_sending() {
    let transport = ScriptedTransport::failing_first(0);
    let store = Arc::new(MemoryOutboxStore::new());
    let row = store
        .enqueue(EnqueueRequest::email(&email("parent@x"), None).unwrap())
        .await
        .unwrap();

    // Claimed and lost to a crash every time, before any send finished.
    for _ in 0..MAX_ATTEMPTS {
        store.claim(row.id).await.unwrap().unwrap();
        store.recover_in_flight().await.unwrap();
    }

    let pipeline = pipeline_with(store, transport.clone());
    pipeline.dispatcher.dispatch_pending().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let (store, _queue, report) = pipeline.stop().await;
    assert_eq!(report.abandoned, 1);
    assert!(transport.calls_to("parent@x").is_empty());

    let row = store.get(row.id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Failed);
    assert_eq!(row.attempt, 5);
    assert_eq!(row.last_error.as_deref(), Some("attempt budget exhausted"));
}
