use serde::{Deserialize, Serialize};

/// Point-in-time cardinalities of a queue's structures.
///
/// The fields are read one after another, not atomically, so under load the
/// sum may briefly count a task twice or miss it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub ready: u64,
    pub delayed: u64,
    pub taken: u64,
    pub buried: u64,
    pub done: i64,
}

impl QueueStats {
    /// Tasks currently held by the queue in any state
    pub fn pending(&self) -> u64 {
        self.ready + self.delayed + self.taken + self.buried
    }
}
