//! Background maintenance for one queue: delayed promotion and lease
//! validation, each an independent tokio task coordinated with other
//! processes through the per-queue locks.

pub mod promoter;
pub mod validator;

pub use promoter::{DelayPromoter, Promotion};
pub use validator::{LeaseValidator, ValidationReport};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{config::QueueConfig, storage::QueueStorage, QueueCtx, QueueId, ReqError, ReqResult};

/// Owns the running maintenance loops of a queue
pub struct MaintenanceHandle {
    qid: QueueId,
    cancel: CancellationToken,
    promoter: JoinHandle<()>,
    validator: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Spawn both loops on the current runtime
    pub fn spawn(storage: QueueStorage, qid: QueueId, config: QueueConfig) -> Self {
        let cancel = CancellationToken::new();
        let ctx = QueueCtx::new().with_cancellation(cancel.clone());

        let promoter = DelayPromoter::new(storage.clone(), qid.clone(), config.clone());
        let validator = LeaseValidator::new(storage, qid.clone(), config);

        info!(queue = %qid, "starting queue maintenance");
        Self {
            promoter: tokio::spawn(promoter.run(ctx.child())),
            validator: tokio::spawn(validator.run(ctx.child())),
            qid,
            cancel,
        }
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !(self.promoter.is_finished() && self.validator.is_finished())
    }

    /// Stop both loops and wait for them to finish
    pub async fn shutdown(self) -> ReqResult<()> {
        self.cancel.cancel();

        let (promoter, validator) = tokio::join!(self.promoter, self.validator);
        info!(queue = %self.qid, "queue maintenance stopped");

        promoter.map_err(|e| ReqError::Internal(format!("delay promotion loop: {e}")))?;
        validator.map_err(|e| ReqError::Internal(format!("lease validation loop: {e}")))?;
        Ok(())
    }
}
