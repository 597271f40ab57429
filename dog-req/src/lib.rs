//! # dog-req: Distributed Task Queue over a Shared Store
//!
//! **Lease-based task queue whose entire state lives in a key-value store**
//!
//! Any number of processes can put, take and complete tasks on the same named
//! queue. Coordination happens only through the store: atomic list moves hand
//! out work, token-owned locks serialize maintenance, and expired leases are
//! reclaimed so nothing taken by a crashed worker is lost.
//!
//! ## Features
//!
//! - **At-least-once delivery**: taken tasks whose lease runs out go back to the ready list
//! - **Delayed tasks**: a sorted set keyed by due time, promoted by a background loop
//! - **Burial**: quarantine poisonous tasks, kick them back when fixed
//! - **Uniform retry**: transient store failures are retried with capped exponential backoff
//! - **Cancellation**: every operation takes a `QueueCtx` and stops promptly when it fires
//! - **Worker pools**: run a `TaskHandler` over the queue with settle-by-outcome semantics
//! - **Pluggable stores**: in-memory for tests, Redis behind the `redis` feature
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dog_req::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn demo() -> ReqResult<()> {
//! let storage = QueueStorage::new(Arc::new(MemoryStore::new()), StorageConfig::default())?;
//! let ctx = QueueCtx::new();
//! let queue = Queue::open(storage, QueueConfig::named("emails"), &ctx).await?;
//!
//! queue.put(&ctx, b"send welcome mail".to_vec(), Duration::ZERO).await?;
//!
//! let task = queue.take(&ctx).await?;
//! // ... do the work ...
//! queue.complete(&ctx, &task.id).await?;
//!
//! queue.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod codec;
pub mod config;
pub mod error;
pub mod keys;
pub mod lock;
pub mod maintenance;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod types;
pub mod worker;

#[cfg(feature = "tracing-basic")]
pub mod observability;

pub use backend::memory::MemoryStore;
pub use backend::{StoreBackend, StoreError, StoreResult};
pub use codec::json::JsonCodec;
pub use codec::TaskCodec;
pub use config::{QueueConfig, StorageConfig};
pub use error::{ReqError, ReqResult, TaskError};
pub use keys::KeySpace;
pub use lock::LockGuard;
pub use maintenance::{DelayPromoter, LeaseValidator, MaintenanceHandle, Promotion, ValidationReport};
pub use queue::Queue;
pub use retry::RetryPolicy;
pub use storage::QueueStorage;
pub use types::{LockToken, QueueCtx, QueueId, QueueStats, Task, TaskId};
pub use worker::{TaskHandler, WorkerConfig, WorkerHandle};

#[cfg(feature = "redis")]
pub use backend::redis::RedisStore;

/// Everything needed to run a queue
pub mod prelude {
    pub use crate::{
        MemoryStore, Queue, QueueConfig, QueueCtx, QueueStats, QueueStorage, ReqError, ReqResult,
        RetryPolicy, StorageConfig, StoreBackend, Task, TaskError, TaskHandler, TaskId, WorkerConfig,
        WorkerHandle,
    };

    #[cfg(feature = "redis")]
    pub use crate::RedisStore;
}
