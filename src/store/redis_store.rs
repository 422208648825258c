//! Redis-backed counter store.
//!
//! Counters and blocks are plain Redis keys whose lifetime is managed by
//! Redis TTLs, so an expired entry is simply missing. Increments run as a
//! single Lua script to keep "increment, then set expiry on a new window"
//! atomic across every process sharing the server.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisResult, Script};
use tracing::{debug, info};

use super::{CallContext, CounterStore};
use crate::config::RedisStoreConfig;
use crate::error::StoreError;

const INCREMENT_SCRIPT: &str = r"
local count = redis.call('INCR', KEYS[1])
if redis.call('PTTL', KEYS[1]) < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
";

/// Redis implementation of [`CounterStore`].
pub struct RedisStore {
    conn: ConnectionManager,
    keys: KeyLayout,
    response_timeout: Duration,
    increment_script: Script,
}

impl RedisStore {
    /// Connect to the configured server and verify it answers.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let client = Client::open(config.url.as_str())?;

        let mut conn =
            tokio::time::timeout(config.response_timeout, client.get_connection_manager())
                .await
                .map_err(|_| StoreError::Timeout(config.response_timeout))??;

        let _: String = tokio::time::timeout(
            config.response_timeout,
            redis::cmd("PING").query_async(&mut conn),
        )
        .await
        .map_err(|_| StoreError::Timeout(config.response_timeout))??;

        info!(key_prefix = %config.key_prefix, "Connected to Redis counter store");

        Ok(Self {
            conn,
            keys: KeyLayout::new(&config.key_prefix),
            response_timeout: config.response_timeout,
            increment_script: Script::new(INCREMENT_SCRIPT),
        })
    }

    /// Run one Redis round trip under the response timeout and the caller's
    /// context.
    async fn execute<T, F>(&self, ctx: &CallContext, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = RedisResult<T>> + Send,
        T: Send,
    {
        let timeout = self.response_timeout;
        ctx.run(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result.map_err(StoreError::from),
                Err(_) => Err(StoreError::Timeout(timeout)),
            }
        })
        .await
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(
        &self,
        ctx: &CallContext,
        key: &str,
        window: Duration,
    ) -> Result<u64, StoreError> {
        let redis_key = self.keys.counter(key);
        let mut conn = self.conn.clone();
        let mut invocation = self.increment_script.key(&redis_key);
        invocation.arg(as_millis(window));

        let count: u64 = self
            .execute(ctx, async move { invocation.invoke_async(&mut conn).await })
            .await?;

        debug!(key = %redis_key, count, "Incremented Redis counter");
        Ok(count)
    }

    async fn get(&self, ctx: &CallContext, key: &str) -> Result<u64, StoreError> {
        let redis_key = self.keys.counter(key);
        let mut conn = self.conn.clone();

        let count: Option<u64> = self
            .execute(ctx, async move {
                redis::cmd("GET").arg(&redis_key).query_async(&mut conn).await
            })
            .await?;

        Ok(count.unwrap_or(0))
    }

    async fn set_block(
        &self,
        ctx: &CallContext,
        key: &str,
        cooldown: Duration,
    ) -> Result<(), StoreError> {
        let redis_key = self.keys.block(key);
        let mut conn = self.conn.clone();

        self.execute(ctx, async move {
            redis::cmd("SET")
                .arg(&redis_key)
                .arg(1)
                .arg("PX")
                .arg(as_millis(cooldown))
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    async fn is_blocked(&self, ctx: &CallContext, key: &str) -> Result<bool, StoreError> {
        let redis_key = self.keys.block(key);
        let mut conn = self.conn.clone();

        self.execute(ctx, async move {
            redis::cmd("EXISTS").arg(&redis_key).query_async(&mut conn).await
        })
        .await
    }
}

/// Maps identity keys onto Redis keys.
///
/// Identity keys always start with a class prefix (`ip:` or `token:`), so
/// the `block:` namespace never overlaps a counter key.
#[derive(Debug, Clone)]
struct KeyLayout {
    prefix: String,
}

impl KeyLayout {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn counter(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn block(&self, key: &str) -> String {
        format!("{}block:{}", self.prefix, key)
    }
}

/// Redis rejects a zero expiry, so round up to at least one millisecond.
fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}
