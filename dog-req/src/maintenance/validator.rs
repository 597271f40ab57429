use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{config::QueueConfig, storage::QueueStorage, QueueCtx, QueueId, ReqError, ReqResult};

/// What one validation pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationReport {
    /// Another process validated within the current period
    pub skipped: bool,
    /// Taken ids inspected
    pub scanned: usize,
    /// Abandoned tasks moved back to the ready list
    pub requeued: usize,
    /// Abandoned tasks that ran out of attempts and were buried
    pub buried: usize,
    /// Taken ids with no body left in the heap
    pub dropped: usize,
}

impl ValidationReport {
    pub fn reclaimed(&self) -> usize {
        self.requeued + self.buried
    }
}

/// Reclaims taken tasks whose lease ran out
pub struct LeaseValidator {
    storage: QueueStorage,
    qid: QueueId,
    config: QueueConfig,
}

impl LeaseValidator {
    pub fn new(storage: QueueStorage, qid: QueueId, config: QueueConfig) -> Self {
        Self { storage, qid, config }
    }

    /// One validation pass under the taken-validation lock
    pub async fn validate_once(&self, ctx: &QueueCtx) -> ReqResult<ValidationReport> {
        let guard = self
            .storage
            .try_lock_before_validating_taken(ctx, &self.qid, self.config.taken_lock_lease)
            .await?;

        let result = self.validate_locked(ctx).await;

        if let Err(e) = guard.release().await {
            warn!(queue = %self.qid, error = %e, "failed to release taken lock");
        }
        result
    }

    async fn validate_locked(&self, ctx: &QueueCtx) -> ReqResult<ValidationReport> {
        let now = Utc::now();
        let mut report = ValidationReport::default();

        match self.storage.get_validation_timestamp(ctx, &self.qid).await {
            Ok(last) => {
                // Half a period of slack: this loop's own previous pass may
                // have stamped late after waiting on its lock
                let since = now.signed_duration_since(last).to_std().unwrap_or_default();
                if since < self.config.validation_period / 2 {
                    debug!(queue = %self.qid, ?since, "validated recently, skipping");
                    report.skipped = true;
                    return Ok(report);
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let ids = self
            .storage
            .get_taken_slice(ctx, &self.qid, self.config.validation_batch)
            .await?;

        for tid in ids {
            report.scanned += 1;

            let task = match self.storage.get_task_from_heap(ctx, &tid).await {
                Ok(task) => task,
                Err(e) if e.is_not_found() => {
                    match self.storage.drop_task_id_from_taken_list(ctx, &self.qid, &tid).await {
                        Ok(()) => {
                            debug!(queue = %self.qid, task_id = %tid, "dropped taken id without body");
                            report.dropped += 1;
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                    continue;
                }
                Err(ReqError::Decode(msg)) => {
                    warn!(queue = %self.qid, task_id = %tid, error = %msg, "undecodable task left on taken list");
                    continue;
                }
                Err(e) => return Err(e),
            };

            if !task.lease_expired(self.config.take_timeout, now) {
                continue;
            }

            match self.storage.drop_task_id_from_taken_list(ctx, &self.qid, &tid).await {
                Ok(()) => {}
                // Completed or reclaimed concurrently
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }

            let bury = self.config.max_attempts > 0 && task.attempts >= self.config.max_attempts;
            let placed = if bury {
                self.storage.put_task_id_to_buried_set(ctx, &self.qid, &tid).await
            } else {
                self.storage.put_task_id_to_ready_list(ctx, &self.qid, &tid).await
            };
            if let Err(e) = placed {
                self.storage.restore_task_id_to_taken_list(ctx, &self.qid, &tid).await;
                return Err(e);
            }

            if bury {
                warn!(queue = %self.qid, task_id = %tid, attempts = task.attempts, "abandoned task buried");
                report.buried += 1;
            } else {
                info!(queue = %self.qid, task_id = %tid, attempts = task.attempts, "abandoned task requeued");
                report.requeued += 1;
            }
        }

        self.storage.set_validation_timestamp(ctx, &self.qid, now).await?;
        Ok(report)
    }

    /// Validate every period until `ctx` is cancelled
    pub async fn run(self, ctx: QueueCtx) {
        info!(queue = %self.qid, period = ?self.config.validation_period, "lease validation loop started");

        let mut ticker = tokio::time::interval(self.config.validation_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.validate_once(&ctx).await {
                Ok(report) if report.reclaimed() > 0 || report.dropped > 0 => {
                    info!(
                        queue = %self.qid,
                        requeued = report.requeued,
                        buried = report.buried,
                        dropped = report.dropped,
                        "reclaimed abandoned leases"
                    );
                }
                Ok(_) => {}
                Err(e) if e.is_locked() => debug!(queue = %self.qid, "validation running elsewhere"),
                Err(e) if e.is_canceled() => break,
                Err(e) => warn!(queue = %self.qid, error = %e, "validation pass failed"),
            }
        }

        info!(queue = %self.qid, "lease validation loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::config::StorageConfig;
    use crate::retry::RetryPolicy;
    use crate::{Task, TaskId};
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(config: QueueConfig) -> (QueueStorage, LeaseValidator, QueueId) {
        setup_with_store(MemoryStore::new(), StorageConfig::default(), config)
    }

    fn setup_with_store(
        store: MemoryStore,
        storage_config: StorageConfig,
        config: QueueConfig,
    ) -> (QueueStorage, LeaseValidator, QueueId) {
        let storage = QueueStorage::new(Arc::new(store), storage_config).unwrap();
        let qid = QueueId::from("1700000000700");
        let validator = LeaseValidator::new(storage.clone(), qid.clone(), config);
        (storage, validator, qid)
    }

    async fn take_with_stamp(storage: &QueueStorage, qid: &QueueId, mut task: Task, taken_ago: Duration) {
        let ctx = QueueCtx::new();
        task.mark_taken(Utc::now() - chrono::Duration::from_std(taken_ago).unwrap());
        storage.put_task_to_heap(&ctx, &task).await.unwrap();
        storage.put_task_id_to_ready_list(&ctx, qid, &task.id).await.unwrap();
        storage.move_task_id_from_ready_list_to_taken(&ctx, qid).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_is_requeued() {
        let config = QueueConfig::default().with_take_timeout(Duration::from_secs(5));
        let (storage, validator, qid) = setup(config);
        let ctx = QueueCtx::new();
        let stale = Task::new(b"stale".to_vec());
        let fresh = Task::new(b"fresh".to_vec());
        take_with_stamp(&storage, &qid, stale.clone(), Duration::from_secs(10)).await;
        take_with_stamp(&storage, &qid, fresh.clone(), Duration::ZERO).await;

        let report = validator.validate_once(&ctx).await.unwrap();

        assert_eq!(report.scanned, 2);
        assert_eq!(report.requeued, 1);
        assert_eq!(storage.get_taken_slice(&ctx, &qid, 10).await.unwrap(), vec![fresh.id]);
        assert_eq!(
            storage.move_task_id_from_ready_list_to_taken(&ctx, &qid).await.unwrap(),
            stale.id
        );
    }

    #[tokio::test]
    async fn test_exhausted_attempts_are_buried() {
        let config = QueueConfig::default()
            .with_take_timeout(Duration::from_secs(1))
            .with_max_attempts(1);
        let (storage, validator, qid) = setup(config);
        let ctx = QueueCtx::new();
        let task = Task::new(b"poison".to_vec());
        take_with_stamp(&storage, &qid, task.clone(), Duration::from_secs(5)).await;

        let report = validator.validate_once(&ctx).await.unwrap();

        assert_eq!(report.buried, 1);
        assert_eq!(storage.get_random_buried_task_id(&ctx, &qid).await.unwrap(), task.id);
        assert_eq!(storage.get_ready_list_len(&ctx, &qid).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_ids_without_body_are_dropped() {
        let (storage, validator, qid) = setup(QueueConfig::default());
        let ctx = QueueCtx::new();
        let orphan = TaskId::new();
        storage.put_task_id_to_ready_list(&ctx, &qid, &orphan).await.unwrap();
        storage.move_task_id_from_ready_list_to_taken(&ctx, &qid).await.unwrap();

        let report = validator.validate_once(&ctx).await.unwrap();

        assert_eq!(report.dropped, 1);
        assert_eq!(storage.get_taken_list_len(&ctx, &qid).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_recent_validation_skips_pass() {
        let config = QueueConfig::default()
            .with_take_timeout(Duration::from_secs(1))
            .with_validation_period(Duration::from_secs(60));
        let (storage, validator, qid) = setup(config);
        let ctx = QueueCtx::new();
        take_with_stamp(&storage, &qid, Task::new(b"x".to_vec()), Duration::from_secs(5)).await;
        storage.set_validation_timestamp(&ctx, &qid, Utc::now()).await.unwrap();

        let report = validator.validate_once(&ctx).await.unwrap();

        assert!(report.skipped);
        assert_eq!(storage.get_taken_list_len(&ctx, &qid).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pass_records_timestamp_and_releases_lock() {
        let (storage, validator, qid) = setup(QueueConfig::default());
        let ctx = QueueCtx::new();

        validator.validate_once(&ctx).await.unwrap();

        assert!(storage.get_validation_timestamp(&ctx, &qid).await.is_ok());
        let lock = storage
            .try_lock_before_validating_taken(&ctx, &qid, Duration::from_secs(1))
            .await
            .unwrap();
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_contention_skips_pass() {
        let (storage, validator, qid) = setup(QueueConfig::default());
        let ctx = QueueCtx::new();
        let held = storage
            .try_lock_before_validating_taken(&ctx, &qid, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(validator.validate_once(&ctx).await.unwrap_err().is_locked());
        held.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_validation_older_than_half_a_period_runs() {
        let config = QueueConfig::default()
            .with_take_timeout(Duration::from_secs(1))
            .with_validation_period(Duration::from_secs(10));
        let (storage, validator, qid) = setup(config);
        let ctx = QueueCtx::new();
        take_with_stamp(&storage, &qid, Task::new(b"x".to_vec()), Duration::from_secs(5)).await;
        let last = Utc::now() - chrono::Duration::seconds(6);
        storage.set_validation_timestamp(&ctx, &qid, last).await.unwrap();

        let report = validator.validate_once(&ctx).await.unwrap();

        assert!(!report.skipped);
        assert_eq!(report.requeued, 1);
    }

    #[tokio::test]
    async fn test_slow_lock_does_not_skip_next_cycle() {
        let store = MemoryStore::new();
        let storage_config = StorageConfig::default()
            .with_retry(RetryPolicy::new(3).with_backoff(Duration::from_millis(50), Duration::from_millis(50)));
        let config = QueueConfig::default()
            .with_take_timeout(Duration::from_millis(50))
            .with_validation_period(Duration::from_millis(300));
        let (storage, validator, qid) = setup_with_store(store.clone(), storage_config, config);
        let ctx = QueueCtx::new();

        // The first pass gets its lock one backoff late and stamps late
        store.inject_failures(1);
        let loop_ctx = ctx.child();
        let handle = tokio::spawn(validator.run(loop_ctx.clone()));

        tokio::time::sleep(Duration::from_millis(100)).await;
        take_with_stamp(&storage, &qid, Task::new(b"abandoned".to_vec()), Duration::ZERO).await;

        // Lease ends at +150ms, the second tick lands at +300ms
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(storage.get_ready_list_len(&ctx, &qid).await.unwrap(), 1);
        assert_eq!(storage.get_taken_list_len(&ctx, &qid).await.unwrap(), 0);

        loop_ctx.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failed_requeue_leaves_id_on_taken_list() {
        let store = MemoryStore::new();
        let storage_config = StorageConfig::default()
            .with_retry(RetryPolicy::new(2).with_backoff(Duration::from_millis(1), Duration::from_millis(1)));
        let config = QueueConfig::default().with_take_timeout(Duration::from_secs(1));
        let (storage, validator, qid) = setup_with_store(store.clone(), storage_config, config);
        let ctx = QueueCtx::new();
        let task = Task::new(b"stale".to_vec());
        take_with_stamp(&storage, &qid, task.clone(), Duration::from_secs(5)).await;
        store.break_key(storage.keys().ready(&qid));

        assert!(validator.validate_once(&ctx).await.is_err());

        assert_eq!(storage.get_taken_slice(&ctx, &qid, 10).await.unwrap(), vec![task.id]);
    }
}
