//! Durable, at-least-once queue of pipeline requests and its worker pool.

pub mod db;
pub mod models;
pub mod worker;

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::Notify;
use tracing::{debug, info};

pub use db::{DbHandle, QueueDb};
pub use models::{JobStatusView, QueueJob, QueueState};
pub use worker::WorkerPool;

use crate::config::{QueueSettings, QueueTarget};
use crate::errors::QueueError;
use crate::pipeline::{PipelinePayload, PipelineReport};

/// Handle to the pipeline queue. Cheap to clone; clones share the database
/// and the wake-up signal.
#[derive(Clone)]
pub struct JobQueue {
    db: DbHandle,
    notify: Arc<Notify>,
    max_attempts: u32,
}

impl JobQueue {
    pub fn new(db: QueueDb, max_attempts: u32) -> Self {
        Self {
            db: DbHandle::new(db),
            notify: Arc::new(Notify::new()),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Open the configured backend and requeue jobs a crashed worker left active.
    /// Only the process that owns the workers should call this.
    pub async fn open(settings: &QueueSettings) -> Result<Self, QueueError> {
        let queue = Self::connect(settings).await?;
        let recovered = queue.recover().await?;
        if recovered > 0 {
            info!(recovered, "requeued jobs left active by a previous process");
        }
        Ok(queue)
    }

    /// Open the configured backend as a client, leaving job states untouched.
    pub async fn connect(settings: &QueueSettings) -> Result<Self, QueueError> {
        let target = settings.target();
        let db = tokio::task::spawn_blocking(move || match target {
            QueueTarget::Memory => QueueDb::new_in_memory(),
            QueueTarget::File(path) => QueueDb::new(&path),
        })
        .await
        .context("Queue open task panicked")?
        .map_err(QueueError::Database)?;

        Ok(Self::new(db, settings.max_attempts))
    }

    /// Store the payload as a `waiting` job and wake a worker.
    pub async fn enqueue(&self, payload: PipelinePayload) -> Result<i64, QueueError> {
        payload.validate().map_err(QueueError::InvalidPayload)?;
        let max_attempts = self.max_attempts;
        let id = self.db.call(move |db| db.enqueue(&payload, max_attempts)).await?;
        debug!(queue_job = id, "enqueued pipeline job");
        self.notify.notify_one();
        Ok(id)
    }

    pub async fn status(&self, id: i64) -> Result<JobStatusView, QueueError> {
        self.get(id).await.map(JobStatusView::from)
    }

    pub async fn get(&self, id: i64) -> Result<QueueJob, QueueError> {
        self.db
            .call(move |db| db.get(id))
            .await?
            .ok_or(QueueError::JobNotFound { id })
    }

    pub async fn claim_next(&self) -> Result<Option<QueueJob>, QueueError> {
        self.db.call(|db| db.claim_next()).await
    }

    pub async fn complete(&self, id: i64, report: &PipelineReport) -> Result<(), QueueError> {
        let result = serde_json::to_string(report).context("Failed to serialize pipeline report")?;
        self.db.call(move |db| db.complete(id, &result)).await
    }

    pub async fn fail(&self, id: i64, error: &str) -> Result<QueueState, QueueError> {
        let error = error.to_string();
        let state = self.db.call(move |db| db.fail(id, &error)).await?;
        if state == QueueState::Waiting {
            self.notify.notify_one();
        }
        Ok(state)
    }

    pub async fn release(&self, id: i64) -> Result<(), QueueError> {
        self.db.call(move |db| db.release(id)).await?;
        self.notify.notify_one();
        Ok(())
    }

    pub async fn recover(&self) -> Result<usize, QueueError> {
        self.db.call(|db| db.requeue_active()).await
    }

    pub async fn count(&self, state: QueueState) -> Result<i64, QueueError> {
        self.db.call(move |db| db.count_by_state(state)).await
    }

    /// Resolves when a job may be available.
    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> JobQueue {
        JobQueue::new(QueueDb::new_in_memory().unwrap(), 1)
    }

    #[tokio::test]
    async fn test_enqueue_and_status() {
        let queue = queue();
        let id = queue
            .enqueue(PipelinePayload::new("p1", "build a todo app"))
            .await
            .unwrap();
        let status = queue.status(id).await.unwrap();
        assert_eq!(status.state, QueueState::Waiting);
        assert!(status.result.is_none());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_missing_fields() {
        let queue = queue();
        let err = queue.enqueue(PipelinePayload::new("", "x")).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidPayload(ref m) if m.contains("projectId")));
        assert_eq!(queue.count(QueueState::Waiting).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_unknown_job() {
        let err = queue().status(404).await.unwrap_err();
        assert!(matches!(err, QueueError::JobNotFound { id: 404 }));
    }

    #[tokio::test]
    async fn test_enqueue_wakes_waiter() {
        let queue = queue();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.notified().await })
        };
        queue.enqueue(PipelinePayload::new("p", "x")).await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("waiter should be notified")
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_memory_target() {
        let settings = QueueSettings {
            url: ":memory:".into(),
            ..Default::default()
        };
        let queue = JobQueue::open(&settings).await.unwrap();
        assert_eq!(queue.count(QueueState::Active).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_open_file_target_recovers_active_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");
        {
            let db = QueueDb::new(&path).unwrap();
            db.enqueue(&PipelinePayload::new("p", "x"), 1).unwrap();
            db.claim_next().unwrap();
        }
        let settings = QueueSettings {
            url: format!("sqlite://{}", path.display()),
            ..Default::default()
        };
        let client = JobQueue::connect(&settings).await.unwrap();
        assert_eq!(client.count(QueueState::Active).await.unwrap(), 1);

        let queue = JobQueue::open(&settings).await.unwrap();
        assert_eq!(queue.count(QueueState::Waiting).await.unwrap(), 1);
        assert_eq!(queue.count(QueueState::Active).await.unwrap(), 0);
    }
}
