// Execution Queue - bounded fire-and-forget lane for action jobs
//
// The queue itself never retries: backoff lives inside ActionExecutor.
// The only thing added here is a bounded buffer, a worker cap, and a
// hard per-job timeout so a stuck delivery cannot wedge a worker.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{ActionExecutor, ExecutionJob};
use crate::config::ExecutionConfig;
use crate::error::AppError;

struct QueuedJob {
    job: ExecutionJob,
    caller: Option<Uuid>,
}

#[derive(Clone)]
pub struct ExecutionQueue {
    tx: mpsc::Sender<QueuedJob>,
}

impl ExecutionQueue {
    /// Spawn the dispatcher and its worker pool.
    pub fn start(executor: ActionExecutor, config: &ExecutionConfig) -> Self {
        let (tx, mut rx) = mpsc::channel::<QueuedJob>(config.queue_depth);
        let workers = Arc::new(Semaphore::new(config.workers));
        let job_timeout = Duration::from_secs(config.job_timeout_secs);
        let (worker_count, depth) = (config.workers, config.queue_depth);

        tokio::spawn(async move {
            info!(
                "Execution queue started ({} workers, depth {})",
                worker_count, depth
            );

            while let Some(queued) = rx.recv().await {
                let permit = match workers.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    // Semaphore is never closed while the dispatcher runs
                    Err(_) => break,
                };
                let executor = executor.clone();

                tokio::spawn(async move {
                    let workflow_id = queued.job.workflow_id;
                    let node_id = queued.job.node_id.clone();

                    match tokio::time::timeout(
                        job_timeout,
                        executor.execute(&queued.job, queued.caller),
                    )
                    .await
                    {
                        Ok(Ok(result)) if result.success => {}
                        Ok(Ok(result)) => {
                            warn!(
                                "Queued action {} on workflow {} failed: {}",
                                node_id,
                                workflow_id,
                                result.error.as_deref().unwrap_or("unknown error")
                            );
                        }
                        Ok(Err(e)) => {
                            warn!(
                                "Queued action {} on workflow {} rejected: {}",
                                node_id,
                                workflow_id,
                                e.message()
                            );
                        }
                        Err(_) => {
                            error!(
                                "Queued action {} on workflow {} timed out after {:?}",
                                node_id, workflow_id, job_timeout
                            );
                        }
                    }

                    drop(permit);
                });
            }

            info!("Execution queue dispatcher stopped");
        });

        Self { tx }
    }

    /// Accept a job for background execution. Rejects when the buffer is
    /// full rather than blocking the HTTP handler.
    pub fn enqueue(&self, job: ExecutionJob, caller: Option<Uuid>) -> Result<(), AppError> {
        self.tx
            .try_send(QueuedJob { job, caller })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => AppError::ExternalServiceError {
                    service: "execution queue".to_string(),
                    message: "queue is at capacity".to_string(),
                },
                mpsc::error::TrySendError::Closed(_) => {
                    AppError::internal("Execution queue is not running")
                }
            })
    }
}
