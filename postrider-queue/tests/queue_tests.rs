//! Integration tests for the SQLite-backed queue: leasing, dedup, delayed
//! execution, attempt accounting and visibility-timeout reclaim.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use postrider_common::Signal;
use postrider_queue::{JobHandler, QueueOptions, SqliteWorkQueue, WorkQueue};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct TestJob {
    field: String,
}

struct Collector {
    tx: mpsc::UnboundedSender<TestJob>,
}

#[async_trait]
impl JobHandler<TestJob> for Collector {
    async fn handle(&self, item: TestJob) -> anyhow::Result<()> {
        self.tx.send(item)?;
        Ok(())
    }
}

struct FailNTimes {
    calls: Arc<AtomicU32>,
    fail_first: u32,
}

#[async_trait]
impl JobHandler<TestJob> for FailNTimes {
    async fn handle(&self, _item: TestJob) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            anyhow::bail!("induced failure {call}");
        }
        Ok(())
    }
}

struct HangFirst {
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl JobHandler<TestJob> for HangFirst {
    async fn handle(&self, _item: TestJob) -> anyhow::Result<()> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            // Simulate a stalled worker; its lease must expire.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        Ok(())
    }
}

async fn open_queue(
    dir: &tempfile::TempDir,
    pool_size: usize,
    visibility: Duration,
) -> SqliteWorkQueue<TestJob> {
    SqliteWorkQueue::open(dir.path().join("queue.db"), "test.queue", pool_size, visibility)
        .await
        .unwrap()
        .with_poll_interval(Duration::from_millis(50))
}

fn spawn_consumer(
    queue: &SqliteWorkQueue<TestJob>,
    shutdown: &broadcast::Sender<Signal>,
    handler: Arc<dyn JobHandler<TestJob>>,
) -> tokio::task::JoinHandle<()> {
    let queue = queue.clone();
    let shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        queue.consume(shutdown, handler).await.unwrap();
    })
}

#[tokio::test]
async fn queued_job_is_processed() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir, 1, Duration::from_secs(5)).await;
    let (shutdown, _) = broadcast::channel(1);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = spawn_consumer(&queue, &shutdown, Arc::new(Collector { tx }));

    queue
        .queue(
            TestJob {
                field: "foo".to_string(),
            },
            QueueOptions::default(),
        )
        .await
        .unwrap();

    let job = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("job not processed in time")
        .unwrap();
    assert_eq!(job.field, "foo");

    shutdown.send(Signal::Shutdown).unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn jobs_are_processed_in_ready_order() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir, 1, Duration::from_secs(5)).await;

    for field in ["one", "two", "three"] {
        queue
            .queue(
                TestJob {
                    field: field.to_string(),
                },
                QueueOptions::default(),
            )
            .await
            .unwrap();
    }

    let (shutdown, _) = broadcast::channel(1);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = spawn_consumer(&queue, &shutdown, Arc::new(Collector { tx }));

    for expected in ["one", "two", "three"] {
        let job = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("job not processed in time")
            .unwrap();
        assert_eq!(job.field, expected);
    }

    shutdown.send(Signal::Shutdown).unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn delivered_job_is_never_leased_again() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir, 2, Duration::from_secs(1)).await;
    let (shutdown, _) = broadcast::channel(1);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = spawn_consumer(&queue, &shutdown, Arc::new(Collector { tx }));

    queue
        .queue(
            TestJob {
                field: "once".to_string(),
            },
            QueueOptions::default(),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("job not processed in time")
        .unwrap();

    // Past the visibility timeout, a second lease of the same job would
    // surface here.
    let extra = tokio::time::timeout(Duration::from_millis(1500), rx.recv()).await;
    assert!(extra.is_err(), "job was leased twice");

    shutdown.send(Signal::Shutdown).unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn dedup_key_results_in_single_processing() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir, 1, Duration::from_secs(5)).await;

    let job = TestJob {
        field: "dedup".to_string(),
    };
    let options = QueueOptions::default().with_dedup_key("k");
    queue.queue(job.clone(), options.clone()).await.unwrap();
    queue.queue(job, options).await.unwrap();

    let (shutdown, _) = broadcast::channel(1);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = spawn_consumer(&queue, &shutdown, Arc::new(Collector { tx }));

    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("job not processed in time")
        .unwrap();
    let extra = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(extra.is_err(), "dedup key did not suppress the duplicate");

    shutdown.send(Signal::Shutdown).unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn delayed_job_waits_for_execute_after() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir, 1, Duration::from_secs(5)).await;
    let (shutdown, _) = broadcast::channel(1);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let consumer = spawn_consumer(&queue, &shutdown, Arc::new(Collector { tx }));

    queue
        .queue(
            TestJob {
                field: "later".to_string(),
            },
            QueueOptions::default().with_delay(Duration::from_secs(1)),
        )
        .await
        .unwrap();

    let early = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
    assert!(early.is_err(), "delayed job became ready too early");

    tokio::time::timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("delayed job never became ready")
        .unwrap();

    shutdown.send(Signal::Shutdown).unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn failing_job_consumes_exactly_its_attempts() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir, 1, Duration::from_secs(5)).await;
    let (shutdown, _) = broadcast::channel(1);
    let calls = Arc::new(AtomicU32::new(0));
    let consumer = spawn_consumer(
        &queue,
        &shutdown,
        Arc::new(FailNTimes {
            calls: Arc::clone(&calls),
            fail_first: u32::MAX,
        }),
    );

    queue
        .queue(
            TestJob {
                field: "doomed".to_string(),
            },
            QueueOptions::default().with_attempts(2),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    shutdown.send(Signal::Shutdown).unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn job_succeeds_after_a_retried_failure() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir, 1, Duration::from_secs(5)).await;
    let (shutdown, _) = broadcast::channel(1);
    let calls = Arc::new(AtomicU32::new(0));
    let consumer = spawn_consumer(
        &queue,
        &shutdown,
        Arc::new(FailNTimes {
            calls: Arc::clone(&calls),
            fail_first: 1,
        }),
    );

    queue
        .queue(
            TestJob {
                field: "flaky".to_string(),
            },
            QueueOptions::default().with_attempts(3),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    // One failure, one success, then the job is gone.
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    shutdown.send(Signal::Shutdown).unwrap();
    consumer.await.unwrap();
}

#[tokio::test]
async fn stalled_lease_is_reclaimed_after_visibility_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let queue = open_queue(&dir, 2, Duration::from_secs(1)).await;
    let (shutdown, _) = broadcast::channel(1);
    let calls = Arc::new(AtomicU32::new(0));
    let consumer = spawn_consumer(
        &queue,
        &shutdown,
        Arc::new(HangFirst {
            calls: Arc::clone(&calls),
        }),
    );

    queue
        .queue(
            TestJob {
                field: "reclaim".to_string(),
            },
            QueueOptions::default().with_attempts(2),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    // First lease hangs, the second worker picks the job up again once the
    // deadline passes.
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    shutdown.send(Signal::Shutdown).unwrap();
    consumer.abort();
    let _ = consumer.await;
}
