use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a new unique task ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a task ID from a string
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Identifier namespacing every per-queue structure in the store.
///
/// Queue names resolve to a `QueueId` through a durable mapping, so a queue
/// can be recreated under the same name with a fresh id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueId(pub String);

impl QueueId {
    /// Derive an id from unix seconds and a random suffix in `100..1000`.
    ///
    /// Pure in its inputs: pass a seeded rng to get reproducible ids.
    pub fn generate<R: Rng + ?Sized>(now: DateTime<Utc>, rng: &mut R) -> Self {
        Self(format!("{}{}", now.timestamp(), rng.gen_range(100..1000)))
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for QueueId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for QueueId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Ownership token for a distributed lock
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(pub String);

impl LockToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_queue_id_is_deterministic_for_same_inputs() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();

        let a = QueueId::generate(now, &mut StdRng::seed_from_u64(7));
        let b = QueueId::generate(now, &mut StdRng::seed_from_u64(7));

        assert_eq!(a, b);
    }

    #[test]
    fn test_queue_id_is_timestamp_followed_by_three_digit_suffix() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..100 {
            let id = QueueId::generate(now, &mut rng);
            let (ts, suffix) = id.as_str().split_at(id.as_str().len() - 3);
            assert_eq!(ts, now.timestamp().to_string());
            let suffix: u32 = suffix.parse().unwrap();
            assert!((100..1000).contains(&suffix));
        }
    }

    #[test]
    fn test_task_ids_are_unique() {
        assert_ne!(TaskId::new(), TaskId::new());
        assert_ne!(LockToken::new(), LockToken::new());
    }
}
