use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use futures::TryFutureExt;
use tracing::{debug, error};

use crate::{
    backend::{StoreBackend, StoreResult},
    codec::{json::JsonCodec, TaskCodec},
    config::StorageConfig,
    keys::KeySpace,
    lock::{self, LockGuard},
    retry::retry,
    QueueCtx, QueueId, ReqError, ReqResult, Task, TaskId,
};

/// Score of a delayed entry: unix seconds with a millisecond fraction
pub fn unix_score(at: DateTime<Utc>) -> f64 {
    at.timestamp_millis() as f64 / 1000.0
}

/// Storage engine: the only writer of the heap and the per-queue structures.
///
/// Every operation is a small, named step over the backing store, routed
/// through the retry wrapper. Multi-step workflows (put, take, complete)
/// are composed by [`crate::Queue`].
#[derive(Clone)]
pub struct QueueStorage {
    backend: Arc<dyn StoreBackend>,
    codec: Arc<dyn TaskCodec>,
    keys: KeySpace,
    config: StorageConfig,
}

impl QueueStorage {
    pub fn new(backend: Arc<dyn StoreBackend>, config: StorageConfig) -> ReqResult<Self> {
        config.validate()?;
        Ok(Self {
            backend,
            codec: Arc::new(JsonCodec),
            keys: KeySpace::new(config.key_prefix.clone()),
            config,
        })
    }

    /// Replace the task record codec
    pub fn with_codec(mut self, codec: Arc<dyn TaskCodec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn codec_id(&self) -> &'static str {
        self.codec.codec_id()
    }

    async fn run<T, F, Fut>(&self, ctx: &QueueCtx, name: &'static str, mut op: F) -> ReqResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        retry(ctx, &self.config.retry, name, || op().map_err(ReqError::from)).await
    }

    // Heap

    pub async fn put_task_to_heap(&self, ctx: &QueueCtx, task: &Task) -> ReqResult<()> {
        let raw = self.codec.encode(task)?;
        let key = self.keys.task(&task.id);
        let (store, key, raw) = (self.backend.as_ref(), key.as_str(), raw.as_str());
        self.run(ctx, "SET task", || store.set(key, raw)).await
    }

    pub async fn get_task_from_heap(&self, ctx: &QueueCtx, tid: &TaskId) -> ReqResult<Task> {
        let key = self.keys.task(tid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        match self.run(ctx, "GET task", || store.get(key)).await? {
            Some(raw) => self.codec.decode(&raw),
            None => Err(ReqError::not_found(format!("task {tid}"))),
        }
    }

    /// Idempotent: dropping an absent body succeeds
    pub async fn drop_task_from_heap(&self, ctx: &QueueCtx, tid: &TaskId) -> ReqResult<()> {
        let key = self.keys.task(tid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        self.run(ctx, "DEL task", || store.del(key)).await?;
        Ok(())
    }

    // Structure inserts

    pub async fn put_task_id_to_delayed_tree(
        &self,
        ctx: &QueueCtx,
        qid: &QueueId,
        tid: &TaskId,
        delay: Duration,
    ) -> ReqResult<()> {
        let due = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| Utc::now().checked_add_signed(delay))
            .ok_or_else(|| ReqError::Encode(format!("delay {delay:?} is out of range")))?;
        let score = unix_score(due);

        let key = self.keys.delayed(qid);
        let (store, key, member) = (self.backend.as_ref(), key.as_str(), tid.as_str());
        self.run(ctx, "ZADD delayed", || store.zadd(key, score, member)).await?;
        Ok(())
    }

    pub async fn put_task_id_to_ready_list(&self, ctx: &QueueCtx, qid: &QueueId, tid: &TaskId) -> ReqResult<()> {
        let key = self.keys.ready(qid);
        let (store, key, member) = (self.backend.as_ref(), key.as_str(), tid.as_str());
        self.run(ctx, "LPUSH ready", || store.lpush(key, member)).await?;
        Ok(())
    }

    pub async fn put_task_id_to_buried_set(&self, ctx: &QueueCtx, qid: &QueueId, tid: &TaskId) -> ReqResult<()> {
        let key = self.keys.buried(qid);
        let (store, key, member) = (self.backend.as_ref(), key.as_str(), tid.as_str());
        self.run(ctx, "SADD buried", || store.sadd(key, member)).await?;
        Ok(())
    }

    /// Put an id back on the taken list. Only used to undo a half-finished
    /// move out of it, so the validator still finds the task.
    pub async fn put_task_id_to_taken_list(&self, ctx: &QueueCtx, qid: &QueueId, tid: &TaskId) -> ReqResult<()> {
        let key = self.keys.taken(qid);
        let (store, key, member) = (self.backend.as_ref(), key.as_str(), tid.as_str());
        self.run(ctx, "LPUSH taken", || store.lpush(key, member)).await?;
        Ok(())
    }

    /// Undo a move out of the taken list whose second step failed.
    /// Runs detached from `ctx`, so a cancelled caller still restores.
    pub async fn restore_task_id_to_taken_list(&self, ctx: &QueueCtx, qid: &QueueId, tid: &TaskId) {
        if let Err(e) = self.put_task_id_to_taken_list(&ctx.detached(), qid, tid).await {
            error!(queue = %qid, task_id = %tid, error = %e, "task left only in heap, restoring to taken failed");
        }
    }

    /// Undo a move out of the buried set whose second step failed
    pub async fn restore_task_id_to_buried_set(&self, ctx: &QueueCtx, qid: &QueueId, tid: &TaskId) {
        if let Err(e) = self.put_task_id_to_buried_set(&ctx.detached(), qid, tid).await {
            error!(queue = %qid, task_id = %tid, error = %e, "task left only in heap, restoring to buried failed");
        }
    }

    // Transitions and removals

    /// Move the oldest ready id onto the taken list, waiting up to the
    /// configured ready wait. `NotFound` when nothing arrived.
    pub async fn move_task_id_from_ready_list_to_taken(&self, ctx: &QueueCtx, qid: &QueueId) -> ReqResult<TaskId> {
        let (ready, taken) = (self.keys.ready(qid), self.keys.taken(qid));
        let (store, ready, taken, wait) = (self.backend.as_ref(), ready.as_str(), taken.as_str(), self.config.ready_wait);

        match self.run(ctx, "BRPOPLPUSH ready taken", || store.brpoplpush(ready, taken, wait)).await? {
            Some(id) => Ok(TaskId::from_string(id)),
            None => Err(ReqError::not_found(format!("no ready task in queue {qid}"))),
        }
    }

    /// Remove exactly one occurrence. `NotFound` means another process
    /// already removed it.
    pub async fn drop_task_id_from_taken_list(&self, ctx: &QueueCtx, qid: &QueueId, tid: &TaskId) -> ReqResult<()> {
        let key = self.keys.taken(qid);
        let (store, key, member) = (self.backend.as_ref(), key.as_str(), tid.as_str());
        let removed = self.run(ctx, "LREM taken", || store.lrem(key, -1, member)).await?;
        if removed != 1 {
            debug!(queue = %qid, task_id = %tid, removed, "task not on taken list");
            return Err(ReqError::not_found(format!("task {tid} is not taken in queue {qid}")));
        }
        Ok(())
    }

    /// Returns whether the id was a member
    pub async fn drop_task_id_from_delayed_tree(&self, ctx: &QueueCtx, qid: &QueueId, tid: &TaskId) -> ReqResult<bool> {
        let key = self.keys.delayed(qid);
        let (store, key, member) = (self.backend.as_ref(), key.as_str(), tid.as_str());
        self.run(ctx, "ZREM delayed", || store.zrem(key, member)).await
    }

    /// Returns whether the id was a member
    pub async fn drop_task_id_from_buried_set(&self, ctx: &QueueCtx, qid: &QueueId, tid: &TaskId) -> ReqResult<bool> {
        let key = self.keys.buried(qid);
        let (store, key, member) = (self.backend.as_ref(), key.as_str(), tid.as_str());
        self.run(ctx, "SREM buried", || store.srem(key, member)).await
    }

    // Reads

    /// Earliest-due delayed id and its score
    pub async fn get_delayed_head(&self, ctx: &QueueCtx, qid: &QueueId) -> ReqResult<(TaskId, f64)> {
        let key = self.keys.delayed(qid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        match self.run(ctx, "ZRANGE delayed", || store.zmin(key)).await? {
            Some((id, score)) => Ok((TaskId::from_string(id), score)),
            None => Err(ReqError::not_found(format!("delayed tree of queue {qid} is empty"))),
        }
    }

    pub async fn get_random_buried_task_id(&self, ctx: &QueueCtx, qid: &QueueId) -> ReqResult<TaskId> {
        let key = self.keys.buried(qid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        match self.run(ctx, "SRANDMEMBER buried", || store.srandmember(key)).await? {
            Some(id) => Ok(TaskId::from_string(id)),
            None => Err(ReqError::not_found(format!("buried set of queue {qid} is empty"))),
        }
    }

    /// Up to `size` taken ids, oldest lease first
    pub async fn get_taken_slice(&self, ctx: &QueueCtx, qid: &QueueId, size: usize) -> ReqResult<Vec<TaskId>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        let start = -(i64::try_from(size).unwrap_or(i64::MAX));
        let key = self.keys.taken(qid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        // Takes land at the head, so the oldest leases sit at the tail
        let ids = self.run(ctx, "LRANGE taken", || store.lrange(key, start, -1)).await?;
        Ok(ids.into_iter().rev().map(TaskId::from_string).collect())
    }

    pub async fn get_ready_list_len(&self, ctx: &QueueCtx, qid: &QueueId) -> ReqResult<u64> {
        let key = self.keys.ready(qid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        self.run(ctx, "LLEN ready", || store.llen(key)).await
    }

    pub async fn get_taken_list_len(&self, ctx: &QueueCtx, qid: &QueueId) -> ReqResult<u64> {
        let key = self.keys.taken(qid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        self.run(ctx, "LLEN taken", || store.llen(key)).await
    }

    pub async fn get_delayed_tree_size(&self, ctx: &QueueCtx, qid: &QueueId) -> ReqResult<u64> {
        let key = self.keys.delayed(qid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        self.run(ctx, "ZCARD delayed", || store.zcard(key)).await
    }

    pub async fn get_buried_set_size(&self, ctx: &QueueCtx, qid: &QueueId) -> ReqResult<u64> {
        let key = self.keys.buried(qid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        self.run(ctx, "SCARD buried", || store.scard(key)).await
    }

    // Done counter

    pub async fn increment_done_counter(&self, ctx: &QueueCtx, qid: &QueueId) -> ReqResult<i64> {
        let key = self.keys.done(qid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        self.run(ctx, "INCR done", || store.incr(key)).await
    }

    /// Zero when nothing was completed yet
    pub async fn get_done_counter_value(&self, ctx: &QueueCtx, qid: &QueueId) -> ReqResult<i64> {
        let key = self.keys.done(qid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        match self.run(ctx, "GET done", || store.get(key)).await? {
            None => Ok(0),
            Some(raw) => raw
                .parse::<i64>()
                .map_err(|_| ReqError::Decode(format!("done counter of queue {qid} is not an integer: {raw:?}"))),
        }
    }

    // Name mapping

    pub async fn get_qid(&self, ctx: &QueueCtx, name: &str) -> ReqResult<QueueId> {
        let key = self.keys.qname(name);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        match self.run(ctx, "GET qname", || store.get(key)).await? {
            Some(id) => Ok(QueueId::from_string(id)),
            None => Err(ReqError::not_found(format!("queue name {name:?}"))),
        }
    }

    /// Point `name` at `qid`, replacing any previous mapping
    pub async fn set_qid_for_name(&self, ctx: &QueueCtx, qid: &QueueId, name: &str) -> ReqResult<()> {
        let key = self.keys.qname(name);
        let (store, key, value) = (self.backend.as_ref(), key.as_str(), qid.as_str());
        self.run(ctx, "SET qname", || store.set(key, value)).await
    }

    /// Map `name` to `qid` unless it is already mapped. Returns the id that
    /// ended up mapped, which is someone else's when they got there first.
    pub async fn claim_qid_for_name(&self, ctx: &QueueCtx, qid: &QueueId, name: &str) -> ReqResult<QueueId> {
        let key = self.keys.qname(name);
        let claimed = {
            let (store, key, value) = (self.backend.as_ref(), key.as_str(), qid.as_str());
            self.run(ctx, "SETNX qname", || store.set_if_absent(key, value)).await?
        };
        if claimed {
            return Ok(qid.clone());
        }
        self.get_qid(ctx, name).await
    }

    // Validation bookkeeping

    pub async fn get_validation_timestamp(&self, ctx: &QueueCtx, qid: &QueueId) -> ReqResult<DateTime<Utc>> {
        let key = self.keys.validated_at(qid);
        let (store, key) = (self.backend.as_ref(), key.as_str());
        let raw = self
            .run(ctx, "GET validated", || store.get(key))
            .await?
            .ok_or_else(|| ReqError::not_found(format!("validation timestamp of queue {qid}")))?;

        raw.parse::<i64>()
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
            .ok_or_else(|| ReqError::Decode(format!("bad validation timestamp {raw:?}")))
    }

    pub async fn set_validation_timestamp(&self, ctx: &QueueCtx, qid: &QueueId, at: DateTime<Utc>) -> ReqResult<()> {
        let key = self.keys.validated_at(qid);
        let value = at.timestamp_millis().to_string();
        let (store, key, value) = (self.backend.as_ref(), key.as_str(), value.as_str());
        self.run(ctx, "SET validated", || store.set(key, value)).await
    }

    // Maintenance locks

    pub async fn try_lock_before_validating_taken(
        &self,
        ctx: &QueueCtx,
        qid: &QueueId,
        lease: Duration,
    ) -> ReqResult<LockGuard> {
        lock::acquire(&self.backend, &self.config.retry, ctx, self.keys.lock_taken(qid), lease).await
    }

    pub async fn try_lock_before_traversing_delayed(
        &self,
        ctx: &QueueCtx,
        qid: &QueueId,
        lease: Duration,
    ) -> ReqResult<LockGuard> {
        lock::acquire(&self.backend, &self.config.retry, ctx, self.keys.lock_delayed(qid), lease).await
    }

    pub async fn try_lock_before_kick(&self, ctx: &QueueCtx, qid: &QueueId, lease: Duration) -> ReqResult<LockGuard> {
        lock::acquire(&self.backend, &self.config.retry, ctx, self.keys.lock_kick(qid), lease).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryStore;
    use crate::retry::RetryPolicy;

    fn storage() -> (MemoryStore, QueueStorage) {
        let store = MemoryStore::new();
        let config = StorageConfig::default()
            .with_ready_wait(Duration::from_millis(50))
            .with_retry(RetryPolicy::new(3).with_backoff(Duration::from_millis(1), Duration::from_millis(2)));
        let storage = QueueStorage::new(Arc::new(store.clone()), config).unwrap();
        (store, storage)
    }

    fn qid() -> QueueId {
        QueueId::from_string("1700000000100".to_string())
    }

    #[tokio::test]
    async fn test_heap_put_get_drop() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        let task = Task::new(b"payload".to_vec());

        storage.put_task_to_heap(&ctx, &task).await.unwrap();
        assert_eq!(storage.get_task_from_heap(&ctx, &task.id).await.unwrap(), task);

        storage.drop_task_from_heap(&ctx, &task.id).await.unwrap();
        assert!(storage.get_task_from_heap(&ctx, &task.id).await.unwrap_err().is_not_found());
        // second drop is a no-op
        storage.drop_task_from_heap(&ctx, &task.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_heap_record_is_permanent() {
        let (store, storage) = storage();
        let ctx = QueueCtx::new();
        let tid = TaskId::new();
        store.set(&storage.keys().task(&tid), "{broken").await.unwrap();

        let err = storage.get_task_from_heap(&ctx, &tid).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn test_ready_to_taken_is_fifo() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        let (first, second) = (TaskId::new(), TaskId::new());

        storage.put_task_id_to_ready_list(&ctx, &qid(), &first).await.unwrap();
        storage.put_task_id_to_ready_list(&ctx, &qid(), &second).await.unwrap();

        assert_eq!(storage.move_task_id_from_ready_list_to_taken(&ctx, &qid()).await.unwrap(), first);
        assert_eq!(storage.move_task_id_from_ready_list_to_taken(&ctx, &qid()).await.unwrap(), second);
        assert_eq!(storage.get_taken_list_len(&ctx, &qid()).await.unwrap(), 2);
        assert_eq!(storage.get_ready_list_len(&ctx, &qid()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_take_from_empty_ready_list_is_not_found() {
        let (_, storage) = storage();
        let err = storage
            .move_task_id_from_ready_list_to_taken(&QueueCtx::new(), &qid())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_taken_slice_is_oldest_first_and_bounded() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        let ids: Vec<TaskId> = (0..4).map(|_| TaskId::new()).collect();
        for id in &ids {
            storage.put_task_id_to_ready_list(&ctx, &qid(), id).await.unwrap();
            storage.move_task_id_from_ready_list_to_taken(&ctx, &qid()).await.unwrap();
        }

        assert_eq!(storage.get_taken_slice(&ctx, &qid(), 2).await.unwrap(), ids[..2].to_vec());
        assert_eq!(storage.get_taken_slice(&ctx, &qid(), 10).await.unwrap(), ids);
        assert!(storage.get_taken_slice(&ctx, &qid(), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_from_taken_twice_reports_lost_race() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        let tid = TaskId::new();
        storage.put_task_id_to_ready_list(&ctx, &qid(), &tid).await.unwrap();
        storage.move_task_id_from_ready_list_to_taken(&ctx, &qid()).await.unwrap();

        storage.drop_task_id_from_taken_list(&ctx, &qid(), &tid).await.unwrap();
        let err = storage.drop_task_id_from_taken_list(&ctx, &qid(), &tid).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delayed_head_orders_by_due_time() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        let (later, sooner) = (TaskId::new(), TaskId::new());

        storage
            .put_task_id_to_delayed_tree(&ctx, &qid(), &later, Duration::from_secs(60))
            .await
            .unwrap();
        storage
            .put_task_id_to_delayed_tree(&ctx, &qid(), &sooner, Duration::from_secs(5))
            .await
            .unwrap();

        let (head, score) = storage.get_delayed_head(&ctx, &qid()).await.unwrap();
        assert_eq!(head, sooner);
        assert!(score > unix_score(Utc::now()));

        assert!(storage.drop_task_id_from_delayed_tree(&ctx, &qid(), &sooner).await.unwrap());
        assert!(!storage.drop_task_id_from_delayed_tree(&ctx, &qid(), &sooner).await.unwrap());
        assert_eq!(storage.get_delayed_tree_size(&ctx, &qid()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_empty_delayed_and_buried_are_not_found() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        assert!(storage.get_delayed_head(&ctx, &qid()).await.unwrap_err().is_not_found());
        assert!(storage.get_random_buried_task_id(&ctx, &qid()).await.unwrap_err().is_not_found());
        assert!(!storage.drop_task_id_from_buried_set(&ctx, &qid(), &TaskId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_buried_set_membership() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        let tid = TaskId::new();

        storage.put_task_id_to_buried_set(&ctx, &qid(), &tid).await.unwrap();
        assert_eq!(storage.get_random_buried_task_id(&ctx, &qid()).await.unwrap(), tid);
        assert_eq!(storage.get_buried_set_size(&ctx, &qid()).await.unwrap(), 1);
        assert!(storage.drop_task_id_from_buried_set(&ctx, &qid(), &tid).await.unwrap());
    }

    #[tokio::test]
    async fn test_done_counter_defaults_to_zero() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();

        assert_eq!(storage.get_done_counter_value(&ctx, &qid()).await.unwrap(), 0);
        assert_eq!(storage.increment_done_counter(&ctx, &qid()).await.unwrap(), 1);
        assert_eq!(storage.increment_done_counter(&ctx, &qid()).await.unwrap(), 2);
        assert_eq!(storage.get_done_counter_value(&ctx, &qid()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_name_mapping_claim_and_replace() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        let (first, second) = (QueueId::from("111"), QueueId::from("222"));

        assert!(storage.get_qid(&ctx, "emails").await.unwrap_err().is_not_found());
        assert_eq!(storage.claim_qid_for_name(&ctx, &first, "emails").await.unwrap(), first);
        assert_eq!(storage.claim_qid_for_name(&ctx, &second, "emails").await.unwrap(), first);

        storage.set_qid_for_name(&ctx, &second, "emails").await.unwrap();
        assert_eq!(storage.get_qid(&ctx, "emails").await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_validation_timestamp_roundtrip() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        assert!(storage.get_validation_timestamp(&ctx, &qid()).await.unwrap_err().is_not_found());

        let at = Utc.timestamp_millis_opt(1_700_000_000_123).single().unwrap();
        storage.set_validation_timestamp(&ctx, &qid(), at).await.unwrap();
        assert_eq!(storage.get_validation_timestamp(&ctx, &qid()).await.unwrap(), at);
    }

    #[tokio::test]
    async fn test_concurrent_delayed_lock_has_one_winner() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        let lease = Duration::from_secs(5);

        let qid = qid();

        let (a, b) = tokio::join!(
            storage.try_lock_before_traversing_delayed(&ctx, &qid, lease),
            storage.try_lock_before_traversing_delayed(&ctx, &qid, lease),
        );

        let (winner, loser) = match (a, b) {
            (Ok(guard), Err(err)) | (Err(err), Ok(guard)) => (guard, err),
            other => panic!("expected exactly one winner, got {other:?}"),
        };
        assert!(loser.is_locked());
        assert!(winner.release().await.unwrap());

        // different lock names do not contend
        let taken = storage.try_lock_before_validating_taken(&ctx, &qid, lease).await.unwrap();
        let kick = storage.try_lock_before_kick(&ctx, &qid, lease).await.unwrap();
        taken.release().await.unwrap();
        kick.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (store, storage) = storage();
        let ctx = QueueCtx::new();
        let tid = TaskId::new();

        store.inject_failures(2);
        storage.put_task_id_to_ready_list(&ctx, &qid(), &tid).await.unwrap();
        assert_eq!(storage.get_ready_list_len(&ctx, &qid()).await.unwrap(), 1);

        store.inject_failures(3);
        let err = storage.get_ready_list_len(&ctx, &qid()).await.unwrap_err();
        assert!(matches!(err, ReqError::RetriesExhausted { op: "LLEN ready", attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_blocking_take() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        ctx.cancel();

        let err = storage.move_task_id_from_ready_list_to_taken(&ctx, &qid()).await.unwrap_err();
        assert!(err.is_canceled());
    }

    #[tokio::test]
    async fn test_restore_to_taken_survives_cancelled_caller() {
        let (_, storage) = storage();
        let ctx = QueueCtx::new();
        let tid = TaskId::new();
        ctx.cancel();

        storage.restore_task_id_to_taken_list(&ctx, &qid(), &tid).await;

        let live = QueueCtx::new();
        assert_eq!(storage.get_taken_slice(&live, &qid(), 10).await.unwrap(), vec![tid]);
    }
}
