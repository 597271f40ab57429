use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::seq::IteratorRandom;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::backend::{StoreBackend, StoreError, StoreResult};

/// A value slot, typed the way Redis types its keys
#[derive(Debug, Clone)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    ZSet(HashMap<String, f64>),
    Set(HashSet<String>),
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::ZSet(_) => "zset",
            Value::Set(_) => "set",
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Value::Str(_) => false,
            Value::List(items) => items.is_empty(),
            Value::ZSet(members) => members.is_empty(),
            Value::Set(members) => members.is_empty(),
        }
    }
}

#[derive(Debug, Default)]
struct Keyspace {
    values: HashMap<String, Value>,
    /// lock key -> (owner token, expiry)
    locks: HashMap<String, (String, Instant)>,
}

fn wrong_type(key: &str, expected: &str, found: &Value) -> StoreError {
    StoreError::InvalidData(format!(
        "WRONGTYPE {key} holds a {}, expected {expected}",
        found.type_name()
    ))
}

macro_rules! typed_mut {
    ($space:expr, $key:expr, $variant:ident, $name:literal) => {{
        let slot = $space
            .values
            .entry($key.to_string())
            .or_insert_with(|| Value::$variant(Default::default()));
        match slot {
            Value::$variant(inner) => Ok(inner),
            other => Err(wrong_type($key, $name, other)),
        }
    }};
}

macro_rules! typed_ref {
    ($space:expr, $key:expr, $variant:ident, $name:literal) => {{
        match $space.values.get($key) {
            None => Ok(None),
            Some(Value::$variant(inner)) => Ok(Some(inner)),
            Some(other) => Err(wrong_type($key, $name, other)),
        }
    }};
}

/// Resolve Redis-style inclusive range indexes against a list length
fn resolve_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { len + start } else { start }.max(0);
    let stop = if stop < 0 { len + stop } else { stop }.min(len - 1);
    if len == 0 || start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

/// In-memory [`StoreBackend`] for tests and single-process deployments.
///
/// Cloning shares the underlying data, so several "processes" can be
/// simulated by handing clones to independent queues.
#[derive(Clone, Default)]
pub struct MemoryStore {
    space: Arc<RwLock<Keyspace>>,
    /// Woken on every list push so blocked pops can re-check
    pushed: Arc<Notify>,
    /// Number of upcoming calls that fail with `Unavailable`
    failures: Arc<AtomicU32>,
    /// Keys every call on which fails with `Unavailable`
    broken_keys: Arc<RwLock<HashSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` operations fail as if the store were down
    pub fn inject_failures(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Make every operation on `key` fail until [`MemoryStore::heal_key`]
    pub fn break_key(&self, key: impl Into<String>) {
        self.broken_keys.write().insert(key.into());
    }

    pub fn heal_key(&self, key: &str) {
        self.broken_keys.write().remove(key);
    }

    /// Injected failures not yet consumed
    pub fn pending_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    /// Whether a key currently holds a value
    pub fn contains_key(&self, key: &str) -> bool {
        self.space.read().values.contains_key(key)
    }

    /// Number of keys holding a value, locks excluded
    pub fn key_count(&self) -> usize {
        self.space.read().values.len()
    }

    /// Whether a live lock is held under `key`
    pub fn is_locked(&self, key: &str) -> bool {
        let now = Instant::now();
        self.space
            .read()
            .locks
            .get(key)
            .map(|(_, expires)| *expires > now)
            .unwrap_or(false)
    }

    fn check_available(&self, key: &str) -> StoreResult<()> {
        if self.broken_keys.read().contains(key) {
            return Err(StoreError::Unavailable(format!("{key} is unreachable")));
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn prune(space: &mut Keyspace, key: &str) {
        if space.values.get(key).map(Value::is_empty).unwrap_or(false) {
            space.values.remove(key);
        }
    }

    fn rpoplpush(&self, source: &str, destination: &str) -> StoreResult<Option<String>> {
        let mut space = self.space.write();

        if let Some(other) = space.values.get(destination) {
            if !matches!(other, Value::List(_)) {
                return Err(wrong_type(destination, "list", other));
            }
        }

        let popped = match space.values.get_mut(source) {
            None => return Ok(None),
            Some(Value::List(items)) => items.pop_back(),
            Some(other) => return Err(wrong_type(source, "list", other)),
        };
        let Some(value) = popped else {
            return Ok(None);
        };
        Self::prune(&mut space, source);

        let target = typed_mut!(space, destination, List, "list")?;
        target.push_front(value.clone());
        drop(space);

        self.pushed.notify_waiters();
        Ok(Some(value))
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available(key)?;
        let space = self.space.read();
        Ok(typed_ref!(space, key, Str, "string")?.cloned())
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.check_available(key)?;
        self.space
            .write()
            .values
            .insert(key.to_string(), Value::Str(value.to_string()));
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> StoreResult<bool> {
        self.check_available(key)?;
        let mut space = self.space.write();
        if space.values.contains_key(key) {
            return Ok(false);
        }
        space
            .values
            .insert(key.to_string(), Value::Str(value.to_string()));
        Ok(true)
    }

    async fn del(&self, key: &str) -> StoreResult<u64> {
        self.check_available(key)?;
        Ok(self.space.write().values.remove(key).map(|_| 1).unwrap_or(0))
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.check_available(key)?;
        let len = {
            let mut space = self.space.write();
            let items = typed_mut!(space, key, List, "list")?;
            items.push_front(value.to_string());
            items.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> StoreResult<Option<String>> {
        self.check_available(source)?;
        self.check_available(destination)?;
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            // Register before checking so a push in between is not missed
            notified.as_mut().enable();

            if let Some(value) = self.rpoplpush(source, destination)? {
                return Ok(Some(value));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> StoreResult<u64> {
        self.check_available(key)?;
        let mut space = self.space.write();
        let removed = {
            let items = match space.values.get_mut(key) {
                None => return Ok(0),
                Some(Value::List(items)) => items,
                Some(other) => return Err(wrong_type(key, "list", other)),
            };

            let limit = if count == 0 { usize::MAX } else { count.unsigned_abs() as usize };
            let mut removed = 0usize;
            if count >= 0 {
                let mut i = 0;
                while i < items.len() && removed < limit {
                    if items[i] == value {
                        items.remove(i);
                        removed += 1;
                    } else {
                        i += 1;
                    }
                }
            } else {
                let mut i = items.len();
                while i > 0 && removed < limit {
                    i -= 1;
                    if items[i] == value {
                        items.remove(i);
                        removed += 1;
                    }
                }
            }
            removed
        };
        Self::prune(&mut space, key);
        Ok(removed as u64)
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.check_available(key)?;
        let space = self.space.read();
        let Some(items) = typed_ref!(space, key, List, "list")? else {
            return Ok(Vec::new());
        };
        Ok(match resolve_range(items.len(), start, stop) {
            Some((from, to)) => items.range(from..=to).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.check_available(key)?;
        let space = self.space.read();
        Ok(typed_ref!(space, key, List, "list")?
            .map(|items| items.len() as u64)
            .unwrap_or(0))
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        self.check_available(key)?;
        if score.is_nan() {
            return Err(StoreError::InvalidData("score is not a number".to_string()));
        }
        let mut space = self.space.write();
        let members = typed_mut!(space, key, ZSet, "zset")?;
        Ok(members.insert(member.to_string(), score).is_none())
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available(key)?;
        let mut space = self.space.write();
        let removed = match space.values.get_mut(key) {
            None => false,
            Some(Value::ZSet(members)) => members.remove(member).is_some(),
            Some(other) => return Err(wrong_type(key, "zset", other)),
        };
        Self::prune(&mut space, key);
        Ok(removed)
    }

    async fn zmin(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        self.check_available(key)?;
        let space = self.space.read();
        let Some(members) = typed_ref!(space, key, ZSet, "zset")? else {
            return Ok(None);
        };
        Ok(members
            .iter()
            .min_by(|a, b| a.1.total_cmp(b.1).then_with(|| a.0.cmp(b.0)))
            .map(|(member, score)| (member.clone(), *score)))
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.check_available(key)?;
        let space = self.space.read();
        Ok(typed_ref!(space, key, ZSet, "zset")?
            .map(|members| members.len() as u64)
            .unwrap_or(0))
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available(key)?;
        let mut space = self.space.write();
        let members = typed_mut!(space, key, Set, "set")?;
        Ok(members.insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check_available(key)?;
        let mut space = self.space.write();
        let removed = match space.values.get_mut(key) {
            None => false,
            Some(Value::Set(members)) => members.remove(member),
            Some(other) => return Err(wrong_type(key, "set", other)),
        };
        Self::prune(&mut space, key);
        Ok(removed)
    }

    async fn srandmember(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available(key)?;
        let space = self.space.read();
        let Some(members) = typed_ref!(space, key, Set, "set")? else {
            return Ok(None);
        };
        Ok(members.iter().choose(&mut rand::thread_rng()).cloned())
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        self.check_available(key)?;
        let space = self.space.read();
        Ok(typed_ref!(space, key, Set, "set")?
            .map(|members| members.len() as u64)
            .unwrap_or(0))
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.check_available(key)?;
        let mut space = self.space.write();
        let current = match space.values.get(key) {
            None => 0,
            Some(Value::Str(raw)) => raw.parse::<i64>().map_err(|_| {
                StoreError::InvalidData(format!("{key} is not an integer"))
            })?,
            Some(other) => return Err(wrong_type(key, "string", other)),
        };
        let next = current
            .checked_add(1)
            .ok_or_else(|| StoreError::InvalidData(format!("{key} would overflow")))?;
        space
            .values
            .insert(key.to_string(), Value::Str(next.to_string()));
        Ok(next)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available(key)?;
        let now = Instant::now();
        let mut space = self.space.write();
        if let Some((_, expires)) = space.locks.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        space
            .locks
            .insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> StoreResult<bool> {
        self.check_available(key)?;
        let now = Instant::now();
        let mut space = self.space.write();
        let owned = matches!(
            space.locks.get(key),
            Some((owner, expires)) if owner == token && *expires > now
        );
        if owned {
            space.locks.remove(key);
        }
        Ok(owned)
    }
}
