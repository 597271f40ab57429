//! Configuration for the storage engine and for individual queues.
//!
//! Both structs carry defaults and `with_*` setters and are checked once by
//! `validate()` when a `QueueStorage` or `Queue` is constructed.
//!
//! ## Environment overrides
//! `from_env(prefix)` follows the DogRS `PREFIX__SECTION__KEY` convention.
//! Durations are given in milliseconds:
//!
//! ```bash
//! export REQ__QUEUE__NAME=emails
//! export REQ__QUEUE__TAKE_TIMEOUT_MS=30000
//! export REQ__STORAGE__RETRY_LIMIT=8
//! ```

use std::collections::HashMap;
use std::time::Duration;

use crate::{retry::RetryPolicy, ReqError, ReqResult};

/// Name used when none is given
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Prefix of every key the engine writes
pub const DEFAULT_KEY_PREFIX: &str = "req";

/// Settings shared by every queue served from one store
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Prefix of every key written to the store
    pub key_prefix: String,
    /// Retry behavior for transient store failures
    pub retry: RetryPolicy,
    /// How long a take blocks waiting for a ready task
    pub ready_wait: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            retry: RetryPolicy::default(),
            ready_wait: Duration::from_secs(1),
        }
    }
}

impl StorageConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set maximum attempts per store operation
    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry.max_attempts = limit;
        self
    }

    pub fn with_ready_wait(mut self, wait: Duration) -> Self {
        self.ready_wait = wait;
        self
    }

    pub fn validate(&self) -> ReqResult<()> {
        if self.key_prefix.is_empty() {
            return Err(ReqError::invalid_config("key_prefix must not be empty"));
        }
        if self.key_prefix.contains(':') {
            return Err(ReqError::invalid_config("key_prefix must not contain ':'"));
        }
        if self.retry.max_attempts == 0 {
            return Err(ReqError::invalid_config("retry limit must be at least 1"));
        }
        if self.retry.base_backoff > self.retry.max_backoff {
            return Err(ReqError::invalid_config("base_backoff exceeds max_backoff"));
        }
        if self.ready_wait.is_zero() {
            return Err(ReqError::invalid_config("ready_wait must be positive"));
        }
        Ok(())
    }

    /// Defaults overridden by `<PREFIX>__STORAGE__*` variables
    pub fn from_env(prefix: &str) -> ReqResult<Self> {
        let vars = EnvSection::load(prefix, "STORAGE");
        let mut config = Self::default();

        if let Some(key_prefix) = vars.string("KEY_PREFIX") {
            config.key_prefix = key_prefix;
        }
        if let Some(limit) = vars.parse::<u32>("RETRY_LIMIT")? {
            config.retry.max_attempts = limit;
        }
        if let Some(backoff) = vars.millis("RETRY_BACKOFF_MS")? {
            config.retry.base_backoff = backoff;
        }
        if let Some(backoff) = vars.millis("RETRY_MAX_BACKOFF_MS")? {
            config.retry.max_backoff = backoff;
        }
        if let Some(wait) = vars.millis("READY_WAIT_MS")? {
            config.ready_wait = wait;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Per-queue settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Human-readable queue name, resolved to a queue id in the store
    pub name: String,

    /// Lease length before a taken task counts as abandoned
    pub take_timeout: Duration,

    /// Cadence of the lease validation loop
    pub validation_period: Duration,

    /// Maximum taken ids inspected per validation cycle
    pub validation_batch: usize,

    /// Lease of the taken-validation lock
    pub taken_lock_lease: Duration,

    /// Lease of the delayed-traversal lock
    pub delayed_lock_lease: Duration,

    /// Lease of the kick lock
    pub kick_lock_lease: Duration,

    /// Longest the promotion loop sleeps before re-reading the delayed head
    pub max_poll_interval: Duration,

    /// Pause before retrying the delayed lock after contention
    pub lock_retry_interval: Duration,

    /// Maximum promotions per hold of the delayed lock
    pub promotion_batch: usize,

    /// Takes allowed before an abandoned task is buried instead of requeued.
    /// Zero disables automatic burial.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_QUEUE_NAME.to_string(),
            take_timeout: Duration::from_secs(60),
            validation_period: Duration::from_secs(10),
            validation_batch: 1024,
            taken_lock_lease: Duration::from_secs(10),
            delayed_lock_lease: Duration::from_secs(5),
            kick_lock_lease: Duration::from_secs(5),
            max_poll_interval: Duration::from_secs(1),
            lock_retry_interval: Duration::from_millis(250),
            promotion_batch: 512,
            max_attempts: 0,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named<S: Into<String>>(name: S) -> Self {
        Self::default().with_name(name)
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_take_timeout(mut self, timeout: Duration) -> Self {
        self.take_timeout = timeout;
        self
    }

    /// Set the validation period; the taken lock lease follows it
    pub fn with_validation_period(mut self, period: Duration) -> Self {
        self.validation_period = period;
        self.taken_lock_lease = period;
        self
    }

    pub fn with_validation_batch(mut self, batch: usize) -> Self {
        self.validation_batch = batch;
        self
    }

    pub fn with_lock_leases(mut self, taken: Duration, delayed: Duration, kick: Duration) -> Self {
        self.taken_lock_lease = taken;
        self.delayed_lock_lease = delayed;
        self.kick_lock_lease = kick;
        self
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    pub fn with_lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    pub fn with_promotion_batch(mut self, batch: usize) -> Self {
        self.promotion_batch = batch;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn validate(&self) -> ReqResult<()> {
        if self.name.is_empty() {
            return Err(ReqError::invalid_config("queue name must not be empty"));
        }
        let durations = [
            ("take_timeout", self.take_timeout),
            ("validation_period", self.validation_period),
            ("taken_lock_lease", self.taken_lock_lease),
            ("delayed_lock_lease", self.delayed_lock_lease),
            ("kick_lock_lease", self.kick_lock_lease),
            ("max_poll_interval", self.max_poll_interval),
            ("lock_retry_interval", self.lock_retry_interval),
        ];
        for (field, value) in durations {
            if value.is_zero() {
                return Err(ReqError::invalid_config(format!("{field} must be positive")));
            }
        }
        if self.validation_batch == 0 {
            return Err(ReqError::invalid_config("validation_batch must be at least 1"));
        }
        if self.promotion_batch == 0 {
            return Err(ReqError::invalid_config("promotion_batch must be at least 1"));
        }
        Ok(())
    }

    /// Defaults overridden by `<PREFIX>__QUEUE__*` variables
    pub fn from_env(prefix: &str) -> ReqResult<Self> {
        let vars = EnvSection::load(prefix, "QUEUE");
        let mut config = Self::default();

        if let Some(name) = vars.string("NAME") {
            config.name = name;
        }
        if let Some(timeout) = vars.millis("TAKE_TIMEOUT_MS")? {
            config.take_timeout = timeout;
        }
        if let Some(period) = vars.millis("VALIDATION_PERIOD_MS")? {
            config = config.with_validation_period(period);
        }
        if let Some(batch) = vars.parse::<usize>("VALIDATION_BATCH")? {
            config.validation_batch = batch;
        }
        if let Some(lease) = vars.millis("TAKEN_LOCK_LEASE_MS")? {
            config.taken_lock_lease = lease;
        }
        if let Some(lease) = vars.millis("DELAYED_LOCK_LEASE_MS")? {
            config.delayed_lock_lease = lease;
        }
        if let Some(lease) = vars.millis("KICK_LOCK_LEASE_MS")? {
            config.kick_lock_lease = lease;
        }
        if let Some(interval) = vars.millis("MAX_POLL_INTERVAL_MS")? {
            config.max_poll_interval = interval;
        }
        if let Some(interval) = vars.millis("LOCK_RETRY_INTERVAL_MS")? {
            config.lock_retry_interval = interval;
        }
        if let Some(batch) = vars.parse::<usize>("PROMOTION_BATCH")? {
            config.promotion_batch = batch;
        }
        if let Some(attempts) = vars.parse::<u32>("MAX_ATTEMPTS")? {
            config.max_attempts = attempts;
        }

        config.validate()?;
        Ok(config)
    }
}

/// Environment variables under `<PREFIX>__<SECTION>__`, keyed by the rest
struct EnvSection {
    section: String,
    values: HashMap<String, String>,
}

impl EnvSection {
    fn load(prefix: &str, section: &str) -> Self {
        Self::from_vars(prefix, section, std::env::vars())
    }

    fn from_vars<I>(prefix: &str, section: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let head = format!("{}__{}__", prefix.to_uppercase(), section);
        let values = vars
            .into_iter()
            .filter_map(|(key, value)| key.strip_prefix(&head).map(|rest| (rest.to_string(), value)))
            .collect();
        Self {
            section: head,
            values,
        }
    }

    fn string(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> ReqResult<Option<T>> {
        match self.values.get(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
                ReqError::invalid_config(format!("{}{} has invalid value {:?}", self.section, key, raw))
            }),
        }
    }

    fn millis(&self, key: &str) -> ReqResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}
