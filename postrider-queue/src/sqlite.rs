//! SQLite-backed durable queue.
//!
//! All logical queues share one database file; rows carry the queue name.
//! Leasing is a single `UPDATE ... RETURNING` statement, so concurrent
//! workers and concurrent consumers of different queues never hand the same
//! job to two workers inside its visibility window.

use std::{marker::PhantomData, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use postrider_common::Signal;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions},
    Row,
};
use tokio::{sync::broadcast, task::JoinSet};
use tracing::{debug, error, warn};

use crate::{JobHandler, QueueError, QueueOptions, WorkQueue};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    queue               TEXT    NOT NULL,
    payload             TEXT    NOT NULL,
    remaining_attempts  INTEGER NOT NULL,
    execute_after       INTEGER NOT NULL DEFAULT 0,
    visibility_deadline INTEGER,
    dedup_key           TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS jobs_queue_dedup
    ON jobs (queue, dedup_key) WHERE dedup_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS jobs_queue_ready
    ON jobs (queue, execute_after, id);
";

const LEASE_SQL: &str = "
UPDATE jobs
SET visibility_deadline = ?3, remaining_attempts = remaining_attempts - 1
WHERE id = (
    SELECT id FROM jobs
    WHERE queue = ?1
      AND execute_after <= ?2
      AND (visibility_deadline IS NULL OR visibility_deadline <= ?2)
      AND remaining_attempts > 0
    ORDER BY execute_after, id
    LIMIT 1
)
RETURNING id, payload, remaining_attempts
";

const INSERT_SQL: &str = "
INSERT INTO jobs (queue, payload, remaining_attempts, execute_after, dedup_key)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT (queue, dedup_key) WHERE dedup_key IS NOT NULL DO NOTHING
";

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

struct Inner {
    pool: SqlitePool,
    queue_name: String,
    pool_size: usize,
    visibility_timeout: Duration,
    default_attempts: u32,
    poll_interval: Duration,
}

/// A named durable queue over a shared SQLite database.
pub struct SqliteWorkQueue<T> {
    inner: Arc<Inner>,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T> Clone for SqliteWorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

struct LeasedJob {
    id: i64,
    payload: String,
    remaining_attempts: i64,
}

impl<T> SqliteWorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Opens (creating if necessary) the queue database at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema
    /// cannot be applied.
    pub async fn open(
        path: impl AsRef<Path>,
        queue_name: impl Into<String>,
        pool_size: usize,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(u32::try_from(pool_size).unwrap_or(u32::MAX).saturating_add(1))
            .connect_with(options)
            .await?;
        Self::on_pool(pool, queue_name, pool_size, visibility_timeout).await
    }

    /// Builds a queue on an already opened pool, so several logical queues
    /// can share one database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be applied.
    pub async fn on_pool(
        pool: SqlitePool,
        queue_name: impl Into<String>,
        pool_size: usize,
        visibility_timeout: Duration,
    ) -> Result<Self, QueueError> {
        for statement in SCHEMA.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            inner: Arc::new(Inner {
                pool,
                queue_name: queue_name.into(),
                pool_size: pool_size.max(1),
                visibility_timeout,
                default_attempts: DEFAULT_ATTEMPTS,
                poll_interval: DEFAULT_POLL_INTERVAL,
            }),
            _marker: PhantomData,
        })
    }

    /// The underlying pool, for building further queues on one database.
    #[must_use]
    pub fn pool(&self) -> SqlitePool {
        self.inner.pool.clone()
    }

    /// Overrides the attempt count granted to jobs queued without one.
    #[must_use]
    pub fn with_default_attempts(mut self, attempts: u32) -> Self {
        self.update_inner(|inner| inner.default_attempts = attempts.max(1));
        self
    }

    /// Overrides the idle polling interval. Mostly useful in tests.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.update_inner(|inner| inner.poll_interval = interval);
        self
    }

    fn update_inner(&mut self, apply: impl FnOnce(&mut Inner)) {
        let mut inner = Inner {
            pool: self.inner.pool.clone(),
            queue_name: self.inner.queue_name.clone(),
            pool_size: self.inner.pool_size,
            visibility_timeout: self.inner.visibility_timeout,
            default_attempts: self.inner.default_attempts,
            poll_interval: self.inner.poll_interval,
        };
        apply(&mut inner);
        self.inner = Arc::new(inner);
    }

    async fn worker(
        inner: Arc<Inner>,
        handler: Arc<dyn JobHandler<T>>,
        mut shutdown: broadcast::Receiver<Signal>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                () = Self::tick(&inner, handler.as_ref()) => {}
            }
        }
    }

    /// Leases and processes at most one job, sleeping when none is ready.
    async fn tick(inner: &Inner, handler: &dyn JobHandler<T>) {
        let job = match Self::lease_next(inner).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tokio::time::sleep(inner.poll_interval).await;
                return;
            }
            Err(err) => {
                warn!(queue = %inner.queue_name, %err, "failed to lease job, retrying");
                tokio::time::sleep(inner.poll_interval).await;
                return;
            }
        };

        let outcome = match serde_json::from_str::<T>(&job.payload) {
            Ok(item) => handler.handle(item).await,
            Err(err) => Err(QueueError::Deserialize(err).into()),
        };

        let store_result = match outcome {
            Ok(()) => {
                debug!(queue = %inner.queue_name, job_id = job.id, "job completed");
                Self::delete(inner, job.id).await
            }
            Err(err) if job.remaining_attempts > 0 => {
                warn!(
                    queue = %inner.queue_name,
                    job_id = job.id,
                    remaining_attempts = job.remaining_attempts,
                    %err,
                    "job failed, releasing for retry"
                );
                Self::release(inner, job.id).await
            }
            Err(err) => {
                error!(
                    queue = %inner.queue_name,
                    job_id = job.id,
                    %err,
                    "job failed with no attempts left, dead-lettering"
                );
                Self::delete(inner, job.id).await
            }
        };
        if let Err(err) = store_result {
            warn!(queue = %inner.queue_name, job_id = job.id, %err, "failed to settle job");
        }
    }

    async fn lease_next(inner: &Inner) -> Result<Option<LeasedJob>, QueueError> {
        let now = epoch_seconds();
        let deadline =
            now.saturating_add(i64::try_from(inner.visibility_timeout.as_secs()).unwrap_or(i64::MAX));
        let row = sqlx::query(LEASE_SQL)
            .bind(&inner.queue_name)
            .bind(now)
            .bind(deadline)
            .fetch_optional(&inner.pool)
            .await?;
        Ok(row.map(|row| LeasedJob {
            id: row.get("id"),
            payload: row.get("payload"),
            remaining_attempts: row.get("remaining_attempts"),
        }))
    }

    async fn delete(inner: &Inner, id: i64) -> Result<(), QueueError> {
        sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id)
            .execute(&inner.pool)
            .await?;
        Ok(())
    }

    async fn release(inner: &Inner, id: i64) -> Result<(), QueueError> {
        sqlx::query("UPDATE jobs SET visibility_deadline = NULL WHERE id = ?1")
            .bind(id)
            .execute(&inner.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<T> WorkQueue<T> for SqliteWorkQueue<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn queue(&self, item: T, options: QueueOptions) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&item).map_err(QueueError::Serialize)?;
        let attempts = options.attempts.unwrap_or(self.inner.default_attempts).max(1);
        let execute_after = epoch_seconds().saturating_add(
            options
                .delay
                .and_then(|delay| i64::try_from(delay.as_secs()).ok())
                .unwrap_or(0),
        );

        sqlx::query(INSERT_SQL)
            .bind(&self.inner.queue_name)
            .bind(payload)
            .bind(i64::from(attempts))
            .bind(execute_after)
            .bind(options.dedup_key)
            .execute(&self.inner.pool)
            .await?;
        Ok(())
    }

    async fn consume(
        &self,
        shutdown: broadcast::Receiver<Signal>,
        handler: Arc<dyn JobHandler<T>>,
    ) -> Result<(), QueueError> {
        let mut workers = JoinSet::new();
        for _ in 0..self.inner.pool_size {
            workers.spawn(Self::worker(
                Arc::clone(&self.inner),
                Arc::clone(&handler),
                shutdown.resubscribe(),
            ));
        }
        while workers.join_next().await.is_some() {}
        Ok(())
    }
}

fn epoch_seconds() -> i64 {
    i64::try_from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    )
    .unwrap_or(i64::MAX)
}
