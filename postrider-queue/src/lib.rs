//! Durable at-least-once work queues.
//!
//! The relay persists every accepted message and every delivery job through
//! a [`WorkQueue`]. The production implementation is [`SqliteWorkQueue`],
//! backed by a single SQLite file shared by all logical queues; tests use
//! [`MemoryWorkQueue`].
//!
//! Semantics:
//! - a queued job becomes ready once its `execute_after` time has passed;
//! - a worker leases the oldest ready job, hiding it from other workers for
//!   the visibility timeout and consuming one attempt;
//! - handler success deletes the job, handler failure releases the lease
//!   while attempts remain and dead-letters the job once they run out;
//! - a worker that crashes or stalls loses its lease when the visibility
//!   deadline passes, and the job reappears.

pub mod memory;
pub mod sqlite;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use postrider_common::Signal;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub use memory::MemoryWorkQueue;
pub use sqlite::SqliteWorkQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("failed to serialize work item: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize job payload: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Per-job queueing options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Total attempts granted to the job. Defaults to the queue's setting.
    pub attempts: Option<u32>,
    /// Delay before the job first becomes ready.
    pub delay: Option<Duration>,
    /// While a job with this key is pending, queueing another one with the
    /// same key is a silent no-op.
    pub dedup_key: Option<String>,
}

impl QueueOptions {
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }
}

/// Work performed for each leased job.
///
/// A returned error counts against the job's remaining attempts; it is never
/// propagated out of [`WorkQueue::consume`].
#[async_trait]
pub trait JobHandler<T>: Send + Sync {
    async fn handle(&self, item: T) -> anyhow::Result<()>;
}

/// A named, durable queue of jobs of one payload type.
///
/// The trait is object-safe so that the preprocessing and delivery engines
/// can be exercised against in-memory fakes.
#[async_trait]
pub trait WorkQueue<T>: Send + Sync
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Persists one job.
    ///
    /// # Errors
    ///
    /// Returns an error if the item cannot be serialized or the store
    /// rejects the insert. A dedup-key collision is not an error.
    async fn queue(&self, item: T, options: QueueOptions) -> Result<(), QueueError>;

    /// Runs a worker pool over the queue until the shutdown signal fires.
    ///
    /// # Errors
    ///
    /// Returns an error only for unrecoverable store failures during
    /// startup; transient store errors are logged and retried.
    async fn consume(
        &self,
        shutdown: broadcast::Receiver<Signal>,
        handler: Arc<dyn JobHandler<T>>,
    ) -> Result<(), QueueError>;
}
