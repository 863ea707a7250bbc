use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client as RedisClient;
use tokio::time::Instant;

use crate::cache::CounterStore;
use crate::error::{Error, Result};

/// Upper bound on one connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
/// After a failed attempt, callers fail fast for this long.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

enum Connection {
    Disconnected,
    Connecting,
    Connected(MultiplexedConnection),
    Failed(Instant),
}

fn unavailable(message: &str) -> Error {
    Error::TransientInfra {
        store: "counter store",
        message: message.to_string(),
    }
}

/// Redis-backed counters: `INCR` + `EXPIRE` in one MULTI/EXEC, `MGET` for reads.
pub struct RedisCounterStore {
    redis: RedisClient,
    conn: Arc<Mutex<Connection>>,
}

impl RedisCounterStore {
    pub fn new(redis: RedisClient) -> Self {
        Self {
            redis,
            conn: Arc::new(Mutex::new(Connection::Disconnected)),
        }
    }

    fn state(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
        conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Connects lazily so the process starts even while Redis is down.
    ///
    /// Only one attempt runs at a time; other callers fail immediately
    /// instead of queueing behind it.
    async fn connection(&self) -> Result<MultiplexedConnection> {
        {
            let mut state = Self::state(&self.conn);
            match &*state {
                Connection::Connected(conn) => return Ok(conn.clone()),
                Connection::Connecting => return Err(unavailable("connection attempt in progress")),
                Connection::Failed(at) if at.elapsed() < RECONNECT_BACKOFF => {
                    return Err(unavailable("connection recently failed"));
                }
                Connection::Failed(_) | Connection::Disconnected => {}
            }
            *state = Connection::Connecting;
        }

        // The attempt runs in its own task so its outcome is recorded even
        // when the caller gives up first.
        let client = self.redis.clone();
        let conn = Arc::clone(&self.conn);
        let attempt = tokio::spawn(async move {
            let outcome =
                tokio::time::timeout(CONNECT_TIMEOUT, client.get_multiplexed_async_connection()).await;
            let mut state = Self::state(&conn);
            match outcome {
                Ok(Ok(connection)) => {
                    *state = Connection::Connected(connection.clone());
                    Ok(connection)
                }
                Ok(Err(err)) => {
                    tracing::warn!("Redis connection failed: {}", err);
                    *state = Connection::Failed(Instant::now());
                    Err(Error::from(err))
                }
                Err(_) => {
                    tracing::warn!("Redis connection timed out after {:?}", CONNECT_TIMEOUT);
                    *state = Connection::Failed(Instant::now());
                    Err(unavailable("connection timed out"))
                }
            }
        });

        attempt
            .await
            .map_err(|e| Error::Internal(format!("redis connect task failed: {e}")))?
    }

    fn forget_connection(&self) {
        let mut state = Self::state(&self.conn);
        if matches!(*state, Connection::Connected(_)) {
            *state = Connection::Disconnected;
        }
    }

    fn on_error<T>(&self, result: redis::RedisResult<T>) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if err.is_io_error() || err.is_connection_dropped() || err.is_timeout() {
                    self.forget_connection();
                }
                Err(err.into())
            }
        }
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_get(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.connection().await?;
        let ttl_secs = i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX);

        let result: redis::RedisResult<(i64,)> = redis::pipe()
            .atomic()
            .incr(key, 1)
            .expire(key, ttl_secs)
            .ignore()
            .query_async(&mut conn)
            .await;

        let (count,) = self.on_error(result)?;
        Ok(count)
    }

    async fn get_many(&self, keys: &[String]) -> Result<HashMap<String, i64>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let mut conn = self.connection().await?;
        // Explicit MGET: the `mget` helper degrades to GET for a single key.
        let result: redis::RedisResult<Vec<Option<i64>>> =
            redis::cmd("MGET").arg(keys).query_async(&mut conn).await;
        let values = self.on_error(result)?;

        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), v)))
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let result: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        self.on_error(result)?;
        Ok(())
    }
}
