pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Result type for raw store primitives
pub type StoreResult<T> = Result<T, StoreError>;

/// Failures reported by a backing store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Connection lost, timeout, server busy. Worth retrying.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The stored value has the wrong shape for the requested operation
    #[error("invalid data in store: {0}")]
    InvalidData(String),
}

/// Key-value, list, sorted-set, set and counter primitives over a shared
/// store, plus token-owned expiring locks.
///
/// Semantics follow Redis: lists push at the head and pop from the tail,
/// absent keys read as empty collections, and every call is atomic with
/// respect to other callers.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Read a string value
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Write a string value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Write only if the key is absent. Returns true when the write happened.
    async fn set_if_absent(&self, key: &str, value: &str) -> StoreResult<bool>;

    /// Delete a key of any type. Returns the number of keys removed.
    async fn del(&self, key: &str) -> StoreResult<u64>;

    /// Insert at the head of a list. Returns the new length.
    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64>;

    /// Atomically move the tail of `source` to the head of `destination`,
    /// waiting up to `timeout` for `source` to become non-empty.
    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> StoreResult<Option<String>>;

    /// Remove occurrences of `value`. Positive `count` scans from the head,
    /// negative from the tail, zero removes all. Returns how many went.
    async fn lrem(&self, key: &str, count: i64, value: &str) -> StoreResult<u64>;

    /// Elements between `start` and `stop` inclusive; negative indexes
    /// count from the tail.
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>>;

    async fn llen(&self, key: &str) -> StoreResult<u64>;

    /// Add or rescore a member. Returns true if the member is new.
    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool>;

    /// Returns true if the member was present
    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Member with the lowest score, ties broken by member order
    async fn zmin(&self, key: &str) -> StoreResult<Option<(String, f64)>>;

    async fn zcard(&self, key: &str) -> StoreResult<u64>;

    /// Returns true if the member is new
    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Returns true if the member was present
    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool>;

    /// Some member of the set, chosen at random
    async fn srandmember(&self, key: &str) -> StoreResult<Option<String>>;

    async fn scard(&self, key: &str) -> StoreResult<u64>;

    /// Increment an integer counter, creating it at zero. Returns the new value.
    async fn incr(&self, key: &str) -> StoreResult<i64>;

    /// Take an expiring lock if nobody holds it. Returns true on success.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Release a lock only if `token` still owns it. Returns true if released.
    async fn unlock(&self, key: &str, token: &str) -> StoreResult<bool>;
}
