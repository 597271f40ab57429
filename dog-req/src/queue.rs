use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{
    config::QueueConfig,
    lock::LockGuard,
    maintenance::MaintenanceHandle,
    storage::QueueStorage,
    QueueCtx, QueueId, QueueStats, ReqError, ReqResult, Task, TaskId,
};

/// A named queue: composes storage steps into the task lifecycle and owns
/// the queue's maintenance loops.
///
/// Several `Queue` values, in one process or many, may serve the same name.
/// They share state only through the store.
pub struct Queue {
    storage: QueueStorage,
    qid: QueueId,
    config: QueueConfig,
    maintenance: Mutex<Option<MaintenanceHandle>>,
}

impl Queue {
    /// Resolve the queue name, creating a mapping if there is none yet.
    /// No background work is started.
    pub async fn attach(storage: QueueStorage, config: QueueConfig, ctx: &QueueCtx) -> ReqResult<Self> {
        config.validate()?;

        let qid = match storage.get_qid(ctx, &config.name).await {
            Ok(qid) => qid,
            Err(e) if e.is_not_found() => {
                let candidate = Self::fresh_qid();
                let qid = storage.claim_qid_for_name(ctx, &candidate, &config.name).await?;
                if qid == candidate {
                    info!(queue = %config.name, qid = %qid, "created queue");
                }
                qid
            }
            Err(e) => return Err(e),
        };

        debug!(queue = %config.name, qid = %qid, "attached to queue");
        Ok(Self::with_qid(storage, qid, config))
    }

    /// Attach and start maintenance
    pub async fn open(storage: QueueStorage, config: QueueConfig, ctx: &QueueCtx) -> ReqResult<Self> {
        let queue = Self::attach(storage, config, ctx).await?;
        queue.start_maintenance();
        Ok(queue)
    }

    /// Point the name at a brand new, empty queue id. Structures of the
    /// previous id are left in the store untouched.
    pub async fn recreate(storage: QueueStorage, config: QueueConfig, ctx: &QueueCtx) -> ReqResult<Self> {
        config.validate()?;

        let qid = Self::fresh_qid();
        storage.set_qid_for_name(ctx, &qid, &config.name).await?;
        info!(queue = %config.name, qid = %qid, "recreated queue");

        Ok(Self::with_qid(storage, qid, config))
    }

    fn with_qid(storage: QueueStorage, qid: QueueId, config: QueueConfig) -> Self {
        Self {
            storage,
            qid,
            config,
            maintenance: Mutex::new(None),
        }
    }

    fn fresh_qid() -> QueueId {
        let mut rng = rand::thread_rng();
        QueueId::generate(Utc::now(), &mut rng)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn qid(&self) -> &QueueId {
        &self.qid
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn storage(&self) -> &QueueStorage {
        &self.storage
    }

    /// Spawn the promotion and validation loops. A no-op when they already run.
    pub fn start_maintenance(&self) {
        let mut slot = self.maintenance.lock();
        if slot.is_some() {
            return;
        }
        *slot = Some(MaintenanceHandle::spawn(
            self.storage.clone(),
            self.qid.clone(),
            self.config.clone(),
        ));
    }

    pub fn is_maintained(&self) -> bool {
        self.maintenance
            .lock()
            .as_ref()
            .map(MaintenanceHandle::is_running)
            .unwrap_or(false)
    }

    /// Stop the maintenance loops, releasing any lock they hold
    pub async fn shutdown(&self) -> ReqResult<()> {
        let handle = self.maintenance.lock().take();
        match handle {
            Some(handle) => handle.shutdown().await,
            None => Ok(()),
        }
    }

    /// Store a task and make it ready now, or after `delay`
    #[instrument(skip(self, ctx, body), fields(queue = %self.config.name, trace_id = ctx.trace_id.as_deref()))]
    pub async fn put(&self, ctx: &QueueCtx, body: impl Into<Vec<u8>>, delay: Duration) -> ReqResult<TaskId> {
        let task = Task::new(body).with_delay(delay);
        self.storage.put_task_to_heap(ctx, &task).await?;

        let placed = if task.is_delayed() {
            self.storage
                .put_task_id_to_delayed_tree(ctx, &self.qid, &task.id, delay)
                .await
        } else {
            self.storage.put_task_id_to_ready_list(ctx, &self.qid, &task.id).await
        };

        if let Err(e) = placed {
            // Unreferenced body; clean it up even if the caller gave up
            if let Err(cleanup) = self.storage.drop_task_from_heap(&ctx.detached(), &task.id).await {
                warn!(task_id = %task.id, error = %cleanup, "failed to drop body of unplaced task");
            }
            return Err(e);
        }

        debug!(task_id = %task.id, ?delay, "task put");
        Ok(task.id)
    }

    /// Lease the oldest ready task. `NotFound` when none arrived within the
    /// ready wait.
    #[instrument(skip(self, ctx), fields(queue = %self.config.name, trace_id = ctx.trace_id.as_deref()))]
    pub async fn take(&self, ctx: &QueueCtx) -> ReqResult<Task> {
        let tid = self.storage.move_task_id_from_ready_list_to_taken(ctx, &self.qid).await?;

        let mut task = match self.storage.get_task_from_heap(ctx, &tid).await {
            Ok(task) => task,
            Err(e) if e.is_not_found() => {
                warn!(task_id = %tid, "ready id had no body, dropping it");
                self.discard_taken(ctx, &tid).await?;
                return Err(ReqError::not_found(format!("task {tid} has no body")));
            }
            Err(ReqError::Decode(msg)) => {
                warn!(task_id = %tid, error = %msg, "undecodable task, burying it");
                self.discard_taken(ctx, &tid).await?;
                if let Err(e) = self.storage.put_task_id_to_buried_set(ctx, &self.qid, &tid).await {
                    self.storage.restore_task_id_to_taken_list(ctx, &self.qid, &tid).await;
                    return Err(e);
                }
                return Err(ReqError::Decode(msg));
            }
            Err(e) => return Err(e),
        };

        task.mark_taken(Utc::now());
        self.storage.put_task_to_heap(ctx, &task).await?;

        debug!(task_id = %tid, attempts = task.attempts, "task taken");
        Ok(task)
    }

    async fn discard_taken(&self, ctx: &QueueCtx, tid: &TaskId) -> ReqResult<()> {
        match self.storage.drop_task_id_from_taken_list(ctx, &self.qid, tid).await {
            Err(e) if !e.is_not_found() => Err(e),
            _ => Ok(()),
        }
    }

    /// Finish a taken task. `NotFound` means the lease was lost; the task
    /// stays in the heap for whoever holds it now.
    #[instrument(skip(self, ctx, tid), fields(queue = %self.config.name, trace_id = ctx.trace_id.as_deref(), task_id = %tid))]
    pub async fn complete(&self, ctx: &QueueCtx, tid: &TaskId) -> ReqResult<()> {
        self.storage.drop_task_id_from_taken_list(ctx, &self.qid, tid).await?;
        self.storage.drop_task_from_heap(ctx, tid).await?;
        let done = self.storage.increment_done_counter(ctx, &self.qid).await?;
        debug!(done, "task completed");
        Ok(())
    }

    /// Give a taken task back, ready now or after `delay`
    #[instrument(skip(self, ctx, tid), fields(queue = %self.config.name, trace_id = ctx.trace_id.as_deref(), task_id = %tid))]
    pub async fn requeue(&self, ctx: &QueueCtx, tid: &TaskId, delay: Duration) -> ReqResult<()> {
        self.storage.drop_task_id_from_taken_list(ctx, &self.qid, tid).await?;
        let placed = if delay.is_zero() {
            self.storage.put_task_id_to_ready_list(ctx, &self.qid, tid).await
        } else {
            self.storage
                .put_task_id_to_delayed_tree(ctx, &self.qid, tid, delay)
                .await
        };

        // Back on taken, the validator requeues it once the lease runs out
        if placed.is_err() {
            self.storage.restore_task_id_to_taken_list(ctx, &self.qid, tid).await;
        }
        placed
    }

    /// Quarantine a taken task
    #[instrument(skip(self, ctx, tid), fields(queue = %self.config.name, trace_id = ctx.trace_id.as_deref(), task_id = %tid))]
    pub async fn bury(&self, ctx: &QueueCtx, tid: &TaskId) -> ReqResult<()> {
        self.storage.drop_task_id_from_taken_list(ctx, &self.qid, tid).await?;
        if let Err(e) = self.storage.put_task_id_to_buried_set(ctx, &self.qid, tid).await {
            self.storage.restore_task_id_to_taken_list(ctx, &self.qid, tid).await;
            return Err(e);
        }
        info!("task buried");
        Ok(())
    }

    /// Move one buried task back to the ready list
    #[instrument(skip(self, ctx, tid), fields(queue = %self.config.name, trace_id = ctx.trace_id.as_deref(), task_id = %tid))]
    pub async fn kick(&self, ctx: &QueueCtx, tid: &TaskId) -> ReqResult<()> {
        let guard = self.lock_kick(ctx).await?;

        let result = async {
            if !self.storage.drop_task_id_from_buried_set(ctx, &self.qid, tid).await? {
                return Err(ReqError::not_found(format!("task {tid} is not buried")));
            }
            self.unbury(ctx, tid).await
        }
        .await;

        self.release(guard).await;
        result
    }

    /// Move up to `limit` buried tasks back to the ready list. Returns how
    /// many were moved.
    #[instrument(skip(self, ctx), fields(queue = %self.config.name, trace_id = ctx.trace_id.as_deref()))]
    pub async fn kick_all(&self, ctx: &QueueCtx, limit: usize) -> ReqResult<usize> {
        let guard = self.lock_kick(ctx).await?;

        let result = async {
            let mut kicked = 0;
            while kicked < limit {
                let tid = match self.storage.get_random_buried_task_id(ctx, &self.qid).await {
                    Ok(tid) => tid,
                    Err(e) if e.is_not_found() => break,
                    Err(e) => return Err(e),
                };
                if self.storage.drop_task_id_from_buried_set(ctx, &self.qid, &tid).await? {
                    self.unbury(ctx, &tid).await?;
                    kicked += 1;
                }
            }
            Ok::<_, ReqError>(kicked)
        }
        .await;

        self.release(guard).await;
        if let Ok(kicked) = result {
            info!(kicked, "buried tasks kicked");
        }
        result
    }

    /// Snapshot of every structure's size and the done counter
    #[instrument(skip(self, ctx), fields(queue = %self.config.name, trace_id = ctx.trace_id.as_deref()))]
    pub async fn stats(&self, ctx: &QueueCtx) -> ReqResult<QueueStats> {
        let (ready, delayed, taken, buried, done) = tokio::try_join!(
            self.storage.get_ready_list_len(ctx, &self.qid),
            self.storage.get_delayed_tree_size(ctx, &self.qid),
            self.storage.get_taken_list_len(ctx, &self.qid),
            self.storage.get_buried_set_size(ctx, &self.qid),
            self.storage.get_done_counter_value(ctx, &self.qid),
        )?;

        Ok(QueueStats {
            ready,
            delayed,
            taken,
            buried,
            done,
        })
    }

    /// Second half of a kick: the id has left the buried set
    async fn unbury(&self, ctx: &QueueCtx, tid: &TaskId) -> ReqResult<()> {
        let pushed = self.storage.put_task_id_to_ready_list(ctx, &self.qid, tid).await;
        if pushed.is_err() {
            self.storage.restore_task_id_to_buried_set(ctx, &self.qid, tid).await;
        }
        pushed
    }

    async fn lock_kick(&self, ctx: &QueueCtx) -> ReqResult<LockGuard> {
        self.storage
            .try_lock_before_kick(ctx, &self.qid, self.config.kick_lock_lease)
            .await
    }

    async fn release(&self, guard: LockGuard) {
        if let Err(e) = guard.release().await {
            warn!(queue = %self.config.name, error = %e, "failed to release kick lock");
        }
    }
}
