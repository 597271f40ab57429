use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::{
    aio::{ConnectionManager, MultiplexedConnection},
    Client, Cmd, ErrorKind, FromRedisValue, RedisError, Script,
};
use tracing::{debug, info};

use crate::backend::{StoreBackend, StoreError, StoreResult};

const UNLOCK_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

fn map_redis_error(err: RedisError) -> StoreError {
    if err.kind() == ErrorKind::TypeError || err.code() == Some("WRONGTYPE") {
        StoreError::InvalidData(err.to_string())
    } else {
        StoreError::Unavailable(err.to_string())
    }
}

/// Whole seconds for blocking commands, rounded up and never zero
/// (zero would block forever).
fn blocking_timeout_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
    secs.max(1)
}

/// Idle connections kept for blocking pops
const MAX_IDLE_BLOCKING: usize = 16;

/// Connections reserved for blocking commands.
///
/// Redis answers a connection's commands in order, so a blocking pop on the
/// shared connection would stall every other command of the process. Each
/// pop checks out a connection of its own and returns it when the reply
/// arrives. A pop dropped mid-flight drops its connection with it.
struct BlockingConnections {
    client: Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
}

impl BlockingConnections {
    async fn checkout(&self) -> StoreResult<MultiplexedConnection> {
        let idle = self.idle.lock().pop();
        match idle {
            Some(conn) => Ok(conn),
            None => {
                debug!("opening connection for blocking pop");
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(map_redis_error)
            }
        }
    }

    fn checkin(&self, conn: MultiplexedConnection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_BLOCKING {
            idle.push(conn);
        }
    }
}

/// [`StoreBackend`] over a Redis server.
///
/// Regular commands share one multiplexed, auto-reconnecting connection;
/// blocking pops get dedicated connections.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    blocking: Arc<BlockingConnections>,
    unlock: Script,
}

impl RedisStore {
    /// Connect to `url`, e.g. `redis://127.0.0.1:6379/0`
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| StoreError::InvalidData(format!("bad redis url: {e}")))?;
        let store = Self::from_client(client).await?;
        info!(url, "connected to redis");
        Ok(store)
    }

    pub async fn from_client(client: Client) -> StoreResult<Self> {
        let conn = ConnectionManager::new(client.clone()).await.map_err(map_redis_error)?;
        Ok(Self {
            conn,
            blocking: Arc::new(BlockingConnections {
                client,
                idle: Mutex::new(Vec::new()),
            }),
            unlock: Script::new(UNLOCK_SCRIPT),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> StoreResult<T> {
        let mut conn = self.conn.clone();
        cmd.query_async(&mut conn).await.map_err(map_redis_error)
    }
}

#[async_trait]
impl StoreBackend for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.query(redis::cmd("SET").arg(key).arg(value)).await
    }

    async fn set_if_absent(&self, key: &str, value: &str) -> StoreResult<bool> {
        let reply: Option<String> = self.query(redis::cmd("SET").arg(key).arg(value).arg("NX")).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("DEL").arg(key)).await
    }

    async fn lpush(&self, key: &str, value: &str) -> StoreResult<u64> {
        self.query(redis::cmd("LPUSH").arg(key).arg(value)).await
    }

    async fn brpoplpush(
        &self,
        source: &str,
        destination: &str,
        timeout: Duration,
    ) -> StoreResult<Option<String>> {
        let mut conn = self.blocking.checkout().await?;
        let moved: Option<String> = redis::cmd("BRPOPLPUSH")
            .arg(source)
            .arg(destination)
            .arg(blocking_timeout_secs(timeout))
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        // Broken connections are dropped by the `?` above
        self.blocking.checkin(conn);
        Ok(moved)
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> StoreResult<u64> {
        self.query(redis::cmd("LREM").arg(key).arg(count).arg(value)).await
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<String>> {
        self.query(redis::cmd("LRANGE").arg(key).arg(start).arg(stop)).await
    }

    async fn llen(&self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("LLEN").arg(key)).await
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> StoreResult<bool> {
        let added: u64 = self.query(redis::cmd("ZADD").arg(key).arg(score).arg(member)).await?;
        Ok(added > 0)
    }

    async fn zrem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: u64 = self.query(redis::cmd("ZREM").arg(key).arg(member)).await?;
        Ok(removed > 0)
    }

    async fn zmin(&self, key: &str) -> StoreResult<Option<(String, f64)>> {
        let head: Vec<(String, f64)> = self
            .query(redis::cmd("ZRANGE").arg(key).arg(0).arg(0).arg("WITHSCORES"))
            .await?;
        Ok(head.into_iter().next())
    }

    async fn zcard(&self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("ZCARD").arg(key)).await
    }

    async fn sadd(&self, key: &str, member: &str) -> StoreResult<bool> {
        let added: u64 = self.query(redis::cmd("SADD").arg(key).arg(member)).await?;
        Ok(added > 0)
    }

    async fn srem(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: u64 = self.query(redis::cmd("SREM").arg(key).arg(member)).await?;
        Ok(removed > 0)
    }

    async fn srandmember(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("SRANDMEMBER").arg(key)).await
    }

    async fn scard(&self, key: &str) -> StoreResult<u64> {
        self.query(redis::cmd("SCARD").arg(key)).await
    }

    async fn incr(&self, key: &str) -> StoreResult<i64> {
        self.query(redis::cmd("INCR").arg(key)).await
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let reply: Option<String> = self
            .query(redis::cmd("SET").arg(key).arg(token).arg("NX").arg("PX").arg(millis))
            .await?;
        Ok(reply.is_some())
    }

    async fn unlock(&self, key: &str, token: &str) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = self
            .unlock
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(removed > 0)
    }
}
