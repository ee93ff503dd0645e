//! In-memory queue fake for unit tests.
//!
//! Mirrors the [`WorkQueue`] contract closely enough for the preprocessing
//! and delivery engines to be exercised without a database: delivery order
//! is FIFO, delays are honored, and a dedup key suppresses later jobs with
//! the same key for the lifetime of the queue. Attempt accounting is not
//! simulated; a failed handler is logged and the job dropped.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use postrider_common::Signal;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::{JobHandler, QueueError, QueueOptions, WorkQueue};

struct Shared<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    queued: Mutex<Vec<(T, QueueOptions)>>,
    pending_keys: Mutex<HashSet<String>>,
}

/// Unbounded in-process work queue.
pub struct MemoryWorkQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for MemoryWorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for MemoryWorkQueue<T>
where
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MemoryWorkQueue<T>
where
    T: Clone,
{
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            shared: Arc::new(Shared {
                tx,
                rx: tokio::sync::Mutex::new(rx),
                queued: Mutex::new(Vec::new()),
                pending_keys: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Snapshot of everything ever queued, in order.
    pub fn queued(&self) -> Vec<T> {
        self.shared
            .queued
            .lock()
            .expect("queue lock poisoned")
            .iter()
            .map(|(item, _)| item.clone())
            .collect()
    }

    /// Snapshot including the options each item was queued with.
    pub fn queued_with_options(&self) -> Vec<(T, QueueOptions)> {
        self.shared.queued.lock().expect("queue lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.shared.queued.lock().expect("queue lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl<T> WorkQueue<T> for MemoryWorkQueue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn queue(&self, item: T, options: QueueOptions) -> Result<(), QueueError> {
        if let Some(key) = &options.dedup_key {
            let mut keys = self
                .shared
                .pending_keys
                .lock()
                .expect("dedup lock poisoned");
            if !keys.insert(key.clone()) {
                return Ok(());
            }
        }
        let delay = options.delay.unwrap_or(Duration::ZERO);
        self.shared
            .queued
            .lock()
            .expect("queue lock poisoned")
            .push((item.clone(), options));

        let shared = Arc::clone(&self.shared);
        if delay.is_zero() {
            let _ = shared.tx.send(item);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = shared.tx.send(item);
            });
        }
        Ok(())
    }

    async fn consume(
        &self,
        mut shutdown: broadcast::Receiver<Signal>,
        handler: Arc<dyn JobHandler<T>>,
    ) -> Result<(), QueueError> {
        let mut rx = self.shared.rx.lock().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                item = rx.recv() => match item {
                    Some(item) => {
                        if let Err(err) = handler.handle(item).await {
                            warn!(%err, "job failed in memory queue");
                        }
                    }
                    None => break,
                },
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collector {
        tx: mpsc::UnboundedSender<String>,
    }

    #[async_trait]
    impl JobHandler<String> for Collector {
        async fn handle(&self, item: String) -> anyhow::Result<()> {
            self.tx.send(item)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let queue = MemoryWorkQueue::new();
        let (shutdown_tx, _) = broadcast::channel(1);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let consumer = {
            let queue = queue.clone();
            let shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move { queue.consume(shutdown, Arc::new(Collector { tx })).await })
        };

        for item in ["one", "two", "three"] {
            queue
                .queue(item.to_string(), QueueOptions::default())
                .await
                .unwrap();
        }

        for expected in ["one", "two", "three"] {
            let got = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, expected);
        }

        shutdown_tx.send(Signal::Shutdown).unwrap();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dedup_key_suppresses_duplicates() {
        let queue = MemoryWorkQueue::new();
        let options = QueueOptions::default().with_dedup_key("k");
        queue.queue("a".to_string(), options.clone()).await.unwrap();
        queue.queue("a".to_string(), options).await.unwrap();

        assert_eq!(queue.len(), 1);
    }
}
