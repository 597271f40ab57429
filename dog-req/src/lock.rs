//! Token-owned, expiring locks over the backing store.
//!
//! A lock is a key holding a random token with a lease. Only the holder of
//! the token can release it; a crashed holder's lock simply expires.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::{
    backend::StoreBackend,
    retry::{retry, RetryPolicy},
    LockToken, QueueCtx, ReqError, ReqResult,
};

/// Try to obtain `key` for `lease`.
///
/// Transient store failures are retried; contention is reported as
/// `ReqError::Locked` straight away.
pub(crate) async fn acquire(
    backend: &Arc<dyn StoreBackend>,
    policy: &RetryPolicy,
    ctx: &QueueCtx,
    key: String,
    lease: Duration,
) -> ReqResult<LockGuard> {
    let token = LockToken::new();

    let obtained = {
        let store = backend.as_ref();
        let key = key.as_str();
        let token = token.as_str();
        retry(ctx, policy, "LOCK", || async move {
            store.try_lock(key, token, lease).await.map_err(ReqError::from)
        })
        .await?
    };

    if !obtained {
        debug!(lock = %key, "lock held elsewhere");
        return Err(ReqError::locked(key));
    }

    debug!(lock = %key, ?lease, "lock obtained");
    Ok(LockGuard {
        backend: backend.clone(),
        policy: policy.clone(),
        ctx: ctx.detached(),
        key,
        token,
        released: false,
    })
}

/// Proof of holding a lock. Call [`LockGuard::release`] when done; a guard
/// dropped without release hands the unlock to the runtime in the background.
pub struct LockGuard {
    backend: Arc<dyn StoreBackend>,
    policy: RetryPolicy,
    /// Not tied to the acquiring caller so release survives its cancellation
    ctx: QueueCtx,
    key: String,
    token: LockToken,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock if this guard's token still owns it.
    ///
    /// Returns false when the lease had already expired (and possibly been
    /// taken over by someone else).
    pub async fn release(mut self) -> ReqResult<bool> {
        self.released = true;
        let released = unlock(&self.backend, &self.policy, &self.ctx, &self.key, &self.token).await?;
        if released {
            debug!(lock = %self.key, "lock released");
        } else {
            warn!(lock = %self.key, "lock expired before release");
        }
        Ok(released)
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let backend = self.backend.clone();
        let policy = self.policy.clone();
        let ctx = self.ctx.clone();
        let key = std::mem::take(&mut self.key);
        let token = self.token.clone();
        handle.spawn(async move {
            if let Err(e) = unlock(&backend, &policy, &ctx, &key, &token).await {
                warn!(lock = %key, error = %e, "background lock release failed");
            }
        });
    }
}

async fn unlock(
    backend: &Arc<dyn StoreBackend>,
    policy: &RetryPolicy,
    ctx: &QueueCtx,
    key: &str,
    token: &LockToken,
) -> ReqResult<bool> {
    let store = backend.as_ref();
    let token = token.as_str();
    retry(ctx, policy, "UNLOCK", || async move {
        store.unlock(key, token).await.map_err(ReqError::from)
    })
    .await
}
