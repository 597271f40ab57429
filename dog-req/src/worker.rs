use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{error::TaskError, Queue, QueueCtx, ReqError, ReqResult, Task};

/// User code run for every taken task
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, task: &Task) -> Result<(), TaskError>;
}

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent take loops
    pub concurrency: usize,
    /// Delay before a retryable failure becomes ready again
    pub retry_delay: Duration,
    /// Pause after an unexpected store error
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            retry_delay: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Handle for managing worker lifecycle
pub struct WorkerHandle {
    cancel: CancellationToken,
    join_handles: Vec<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn worker_count(&self) -> usize {
        self.join_handles.len()
    }

    /// Stop taking new tasks and wait for in-flight ones to finish
    pub async fn shutdown(self) -> ReqResult<()> {
        self.cancel.cancel();
        for result in futures::future::join_all(self.join_handles).await {
            result.map_err(|e| ReqError::Internal(format!("Worker join error: {e}")))?;
        }
        Ok(())
    }
}

impl Queue {
    /// Spawn `config.concurrency` loops that take tasks and run `handler`
    pub fn start_workers(self: &Arc<Self>, handler: Arc<dyn TaskHandler>, config: WorkerConfig) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let count = config.concurrency.max(1);

        let join_handles = (0..count)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: self.clone(),
                    handler: handler.clone(),
                    config: config.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(queue = %self.name(), workers = count, "started workers");
        WorkerHandle { cancel, join_handles }
    }
}

/// One take loop
struct Worker {
    id: usize,
    queue: Arc<Queue>,
    handler: Arc<dyn TaskHandler>,
    config: WorkerConfig,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) {
        // Cancelling the take does not cancel the handler or its ack
        let take_ctx = QueueCtx::new().with_cancellation(self.cancel.child_token());
        let ack_ctx = QueueCtx::new();

        debug!(queue = %self.queue.name(), worker = self.id, "worker started");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let task = match self.queue.take(&take_ctx).await {
                Ok(task) => task,
                Err(e) if e.is_not_found() => continue,
                Err(e) if e.is_canceled() => break,
                Err(e) => {
                    error!(queue = %self.queue.name(), worker = self.id, error = %e, "take failed");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => continue,
                    }
                }
            };

            if let Err(e) = self.process(&ack_ctx, task).await {
                warn!(queue = %self.queue.name(), worker = self.id, error = %e, "failed to settle task");
            }
        }

        debug!(queue = %self.queue.name(), worker = self.id, "worker stopped");
    }

    async fn process(&self, ctx: &QueueCtx, task: Task) -> ReqResult<()> {
        debug!(task_id = %task.id, attempts = task.attempts, "processing task");

        match self.handler.handle(&task).await {
            Ok(()) => self.queue.complete(ctx, &task.id).await,
            Err(e) => {
                let max_attempts = self.queue.config().max_attempts;
                let exhausted = max_attempts > 0 && task.attempts >= max_attempts;

                if e.is_retryable() && !exhausted {
                    warn!(task_id = %task.id, error = %e, "task failed, will retry");
                    self.queue.requeue(ctx, &task.id, self.config.retry_delay).await
                } else {
                    error!(task_id = %task.id, error = %e, "task failed permanently");
                    self.queue.bury(ctx, &task.id).await
                }
            }
        }
    }
}
