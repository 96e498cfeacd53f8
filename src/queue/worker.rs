use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::JobQueue;
use super::models::{QueueJob, QueueState};
use crate::errors::PipelineError;
use crate::pipeline::Orchestrator;

/// Pool of workers that claim queue jobs and run them through the orchestrator.
pub struct WorkerPool {
    queue: JobQueue,
    orchestrator: Arc<Orchestrator>,
    workers: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(queue: JobQueue, orchestrator: Arc<Orchestrator>, workers: usize, poll_interval: Duration) -> Self {
        Self {
            queue,
            orchestrator,
            workers: workers.max(1),
            poll_interval,
        }
    }

    /// Start the workers. They exit once `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        info!(workers = self.workers, "starting pipeline workers");
        (0..self.workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    self.queue.clone(),
                    Arc::clone(&self.orchestrator),
                    self.poll_interval,
                    cancel.clone(),
                ))
            })
            .collect()
    }
}

async fn worker_loop(
    worker_id: usize,
    queue: JobQueue,
    orchestrator: Arc<Orchestrator>,
    poll_interval: Duration,
    cancel: CancellationToken,
) {
    while !cancel.is_cancelled() {
        match queue.claim_next().await {
            Ok(Some(job)) => process(worker_id, &queue, &orchestrator, job, &cancel).await,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = queue.notified() => {}
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(e) => {
                error!(worker_id, error = %e, "failed to claim queue job");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
    info!(worker_id, "pipeline worker stopped");
}

/// Run one job in its own task so a panic marks the job failed instead of
/// taking the worker down.
async fn process(
    worker_id: usize,
    queue: &JobQueue,
    orchestrator: &Arc<Orchestrator>,
    job: QueueJob,
    cancel: &CancellationToken,
) {
    let id = job.id;
    info!(worker_id, queue_job = id, project_id = %job.payload.project_id, attempt = job.attempts, "processing pipeline job");

    let run = {
        let orchestrator = Arc::clone(orchestrator);
        let cancel = cancel.child_token();
        let payload = job.payload;
        tokio::spawn(async move { orchestrator.run(&payload, cancel).await })
    };

    let recorded = match run.await {
        Ok(Ok(report)) => {
            info!(queue_job = id, status = %report.overall_status, "pipeline job completed");
            queue.complete(id, &report).await
        }
        Ok(Err(PipelineError::Cancelled { stage })) => {
            warn!(queue_job = id, stage = %stage, "pipeline job interrupted, returning to queue");
            queue.release(id).await
        }
        Ok(Err(e)) => record_failure(queue, id, &e.to_string()).await,
        Err(join_err) => {
            let message = if join_err.is_panic() {
                format!("Pipeline worker panicked: {}", panic_message(join_err.into_panic()))
            } else {
                format!("Pipeline task aborted: {}", join_err)
            };
            record_failure(queue, id, &message).await
        }
    };

    if let Err(e) = recorded {
        error!(queue_job = id, error = %e, "failed to record pipeline job outcome");
    }
}

async fn record_failure(queue: &JobQueue, id: i64, message: &str) -> Result<(), crate::errors::QueueError> {
    let state = queue.fail(id, message).await?;
    match state {
        QueueState::Waiting => warn!(queue_job = id, error = message, "pipeline job failed, will retry"),
        _ => error!(queue_job = id, error = message, "pipeline job failed"),
    }
    Ok(())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::pipeline::stages::testing::*;
    use crate::pipeline::{Generator, OverallStatus, PipelinePayload};
    use crate::queue::QueueDb;

    /// Panics when the prompt asks it to, otherwise reports unavailability.
    struct PanickyGenerator;

    #[async_trait]
    impl Generator for PanickyGenerator {
        async fn generate(&self, _system: &str, prompt: &str) -> anyhow::Result<String> {
            if prompt.contains("explode") {
                panic!("generator exploded");
            }
            anyhow::bail!("generator unavailable")
        }
    }

    fn orchestrator(generator: Arc<dyn Generator>) -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new(env(
            generator,
            Arc::new(RecordingFileWriter::default()),
            Arc::new(FakeSandbox::always_ok()),
        )))
    }

    async fn wait_terminal(queue: &JobQueue, id: i64) -> QueueJob {
        for _ in 0..200 {
            let job = queue.get(id).await.unwrap();
            if job.state.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("queue job {} never finished", id);
    }

    #[tokio::test]
    async fn test_enqueued_job_completes_with_report() {
        let queue = JobQueue::new(QueueDb::new_in_memory().unwrap(), 1);
        let cancel = CancellationToken::new();
        let handles = WorkerPool::new(
            queue.clone(),
            orchestrator(Arc::new(ScriptedGenerator::failing())),
            2,
            Duration::from_millis(50),
        )
        .spawn(cancel.clone());

        let id = queue
            .enqueue(PipelinePayload::new("p1", "build a todo app"))
            .await
            .unwrap();
        let job = wait_terminal(&queue, id).await;

        assert_eq!(job.state, QueueState::Completed);
        let report = job.result.unwrap();
        let status: OverallStatus = serde_json::from_value(report["overallStatus"].clone()).unwrap();
        assert!(matches!(
            status,
            OverallStatus::Success | OverallStatus::PartialSuccess | OverallStatus::Failed
        ));

        let logs: Vec<String> = serde_json::from_value(report["logs"].clone()).unwrap();
        let markers: Vec<&str> = logs
            .iter()
            .filter(|l| l.ends_with(":start"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            markers,
            vec!["analyze:start", "plan:start", "execute:start", "test:start", "summarize:start"]
        );

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_panicking_job_fails_and_worker_survives() {
        let queue = JobQueue::new(QueueDb::new_in_memory().unwrap(), 1);
        let cancel = CancellationToken::new();
        let handles = WorkerPool::new(
            queue.clone(),
            orchestrator(Arc::new(PanickyGenerator)),
            1,
            Duration::from_millis(50),
        )
        .spawn(cancel.clone());

        let bad = queue.enqueue(PipelinePayload::new("p1", "explode")).await.unwrap();
        let good = queue.enqueue(PipelinePayload::new("p2", "todo app")).await.unwrap();

        let failed = wait_terminal(&queue, bad).await;
        assert_eq!(failed.state, QueueState::Failed);
        assert!(failed.error.unwrap().contains("generator exploded"));

        let completed = wait_terminal(&queue, good).await;
        assert_eq!(completed.state, QueueState::Completed);

        cancel.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42)), "unknown panic");
    }
}
