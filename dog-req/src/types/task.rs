use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::TaskId;

/// A unit of work. The body is opaque; the queue never interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,

    /// Time after creation before the task may be taken; zero means ready now
    #[serde(default)]
    pub delay: Duration,

    pub body: Vec<u8>,

    /// Set when the task moves into the taken list
    #[serde(default)]
    pub taken_at: Option<DateTime<Utc>>,

    pub enqueued_at: DateTime<Utc>,

    /// How many times the task has been taken
    #[serde(default)]
    pub attempts: u32,
}

impl Task {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            id: TaskId::new(),
            delay: Duration::ZERO,
            body: body.into(),
            taken_at: None,
            enqueued_at: Utc::now(),
            attempts: 0,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn is_delayed(&self) -> bool {
        !self.delay.is_zero()
    }

    /// Record a new lease
    pub fn mark_taken(&mut self, now: DateTime<Utc>) {
        self.taken_at = Some(now);
        self.attempts += 1;
    }

    /// When the current lease started.
    ///
    /// Falls back to the moment the task became ready if the taker never
    /// got to stamp `taken_at`.
    pub fn lease_started_at(&self) -> DateTime<Utc> {
        self.taken_at.unwrap_or_else(|| {
            chrono::Duration::from_std(self.delay)
                .ok()
                .and_then(|delay| self.enqueued_at.checked_add_signed(delay))
                .unwrap_or(self.enqueued_at)
        })
    }

    /// Whether a lease of length `take_timeout` has run out at `now`
    pub fn lease_expired(&self, take_timeout: Duration, now: DateTime<Utc>) -> bool {
        let Ok(timeout) = chrono::Duration::from_std(take_timeout) else {
            return false;
        };
        match self.lease_started_at().checked_add_signed(timeout) {
            Some(deadline) => deadline <= now,
            None => false,
        }
    }
}
