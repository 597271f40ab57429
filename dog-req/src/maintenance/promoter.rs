use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    config::QueueConfig,
    storage::{unix_score, QueueStorage},
    QueueCtx, QueueId, ReqResult,
};

/// Outcome of one hold of the delayed-traversal lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Promotion {
    /// Ids moved from the delayed tree to the ready list
    pub promoted: usize,
    /// Time until the next entry is due. `None` when the tree is empty,
    /// zero when the batch limit stopped the pass early.
    pub next_due_in: Option<Duration>,
}

/// Moves due task ids from the delayed tree onto the ready list.
pub struct DelayPromoter {
    storage: QueueStorage,
    qid: QueueId,
    config: QueueConfig,
}

impl DelayPromoter {
    pub fn new(storage: QueueStorage, qid: QueueId, config: QueueConfig) -> Self {
        Self { storage, qid, config }
    }

    /// Take the delayed lock and promote every due entry, up to the
    /// configured batch. Contention surfaces as `ReqError::Locked`.
    pub async fn promote_due(&self, ctx: &QueueCtx) -> ReqResult<Promotion> {
        let guard = self
            .storage
            .try_lock_before_traversing_delayed(ctx, &self.qid, self.config.delayed_lock_lease)
            .await?;

        let result = self.promote_locked(ctx).await;

        if let Err(e) = guard.release().await {
            warn!(queue = %self.qid, error = %e, "failed to release delayed lock");
        }
        result
    }

    async fn promote_locked(&self, ctx: &QueueCtx) -> ReqResult<Promotion> {
        let mut promoted = 0;

        for _ in 0..self.config.promotion_batch {
            let (tid, score) = match self.storage.get_delayed_head(ctx, &self.qid).await {
                Ok(head) => head,
                Err(e) if e.is_not_found() => {
                    return Ok(Promotion {
                        promoted,
                        next_due_in: None,
                    })
                }
                Err(e) => return Err(e),
            };

            let now = unix_score(Utc::now());
            if score > now {
                return Ok(Promotion {
                    promoted,
                    next_due_in: Some(Duration::try_from_secs_f64(score - now).unwrap_or(self.config.max_poll_interval)),
                });
            }

            // Someone else already moved it
            if !self.storage.drop_task_id_from_delayed_tree(ctx, &self.qid, &tid).await? {
                continue;
            }

            if let Err(e) = self.storage.put_task_id_to_ready_list(ctx, &self.qid, &tid).await {
                // Put it back so the next pass retries instead of losing it
                let restore = ctx.detached();
                if let Err(restore_err) = self
                    .storage
                    .put_task_id_to_delayed_tree(&restore, &self.qid, &tid, Duration::ZERO)
                    .await
                {
                    error!(queue = %self.qid, task_id = %tid, error = %restore_err, "promoted task stranded in heap");
                }
                return Err(e);
            }

            debug!(queue = %self.qid, task_id = %tid, "delayed task promoted");
            promoted += 1;
        }

        Ok(Promotion {
            promoted,
            next_due_in: Some(Duration::ZERO),
        })
    }

    /// Promote until `ctx` is cancelled
    pub async fn run(self, ctx: QueueCtx) {
        info!(queue = %self.qid, "delay promotion loop started");
        let max_poll = self.config.max_poll_interval;

        loop {
            if ctx.is_cancelled() {
                break;
            }

            let wait = match self.promote_due(&ctx).await {
                Ok(pass) => {
                    if pass.promoted > 0 {
                        info!(queue = %self.qid, promoted = pass.promoted, "promoted delayed tasks");
                    }
                    pass.next_due_in.map_or(max_poll, |due| due.min(max_poll))
                }
                Err(e) if e.is_locked() => self.config.lock_retry_interval,
                Err(e) if e.is_canceled() => break,
                Err(e) => {
                    warn!(queue = %self.qid, error = %e, "promotion pass failed");
                    max_poll
                }
            };

            if wait.is_zero() {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                _ = ctx.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        info!(queue = %self.qid, "delay promotion loop stopped");
    }
}
