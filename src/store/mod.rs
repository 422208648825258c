//! Counter and block storage backends.

mod context;
mod counter;
mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::StorageConfig;
use crate::error::StoreError;

pub use context::CallContext;
pub use counter::WindowCounter;
pub use memory::{MemoryStore, SweepStats, SweeperHandle};
pub use redis_store::RedisStore;

/// Storage for fixed-window counters and cooldown blocks.
///
/// Every backend, in-process or networked, implements the same four
/// operations. Expiry is checked when a key is read or incremented, so an
/// entry past its expiry behaves as absent even if it has not been removed.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add one to the counter for `key` and return the new count.
    ///
    /// With no live counter the count starts at 1 and expires after
    /// `window`. A live counter keeps its original expiry.
    async fn increment(
        &self,
        ctx: &CallContext,
        key: &str,
        window: Duration,
    ) -> Result<u64, StoreError>;

    /// Current count for `key`, or 0 if absent or expired.
    async fn get(&self, ctx: &CallContext, key: &str) -> Result<u64, StoreError>;

    /// Block `key` for `cooldown` from now, replacing any existing block.
    async fn set_block(
        &self,
        ctx: &CallContext,
        key: &str,
        cooldown: Duration,
    ) -> Result<(), StoreError>;

    /// Whether `key` has an unexpired block.
    async fn is_blocked(&self, ctx: &CallContext, key: &str) -> Result<bool, StoreError>;
}

/// The store selected by configuration, plus the memory sweeper if one runs.
pub struct ConfiguredStore {
    pub store: Arc<dyn CounterStore>,
    pub sweeper: Option<SweeperHandle>,
}

impl ConfiguredStore {
    /// Build the configured backend. Redis is connected and pinged first.
    pub async fn from_config(config: &StorageConfig) -> crate::error::Result<Self> {
        match config {
            StorageConfig::Memory(memory) => {
                let store = Arc::new(MemoryStore::new());
                let sweeper = memory.sweep_interval.map(|period| store.spawn_sweeper(period));
                info!(sweeper = sweeper.is_some(), "Using in-memory counter store");
                Ok(Self {
                    store,
                    sweeper,
                })
            }
            StorageConfig::Redis(redis) => {
                let store = RedisStore::connect(redis).await?;
                info!(url = %redis.url, "Using Redis counter store");
                Ok(Self {
                    store: Arc::new(store),
                    sweeper: None,
                })
            }
        }
    }

    /// Stop the sweeper, if any, and wait for it to exit.
    pub async fn shutdown(self) {
        if let Some(sweeper) = self.sweeper {
            sweeper.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MemoryStoreConfig, RedisStoreConfig};
    use crate::error::RatewardenError;

    #[tokio::test]
    async fn test_memory_store_with_sweeper() {
        let config = StorageConfig::Memory(MemoryStoreConfig {
            sweep_interval: Some(Duration::from_secs(60)),
        });

        let configured = ConfiguredStore::from_config(&config).await.unwrap();
        assert!(configured.sweeper.is_some());
        assert_eq!(configured.store.get(&CallContext::new(), "ip:1.1.1.1").await.unwrap(), 0);

        configured.shutdown().await;
    }

    #[tokio::test]
    async fn test_memory_store_without_sweeper() {
        let config = StorageConfig::Memory(MemoryStoreConfig {
            sweep_interval: None,
        });

        let configured = ConfiguredStore::from_config(&config).await.unwrap();
        assert!(configured.sweeper.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_redis_is_a_store_error() {
        let config = StorageConfig::Redis(RedisStoreConfig {
            url: "redis://127.0.0.1:1/".to_string(),
            key_prefix: "test:".to_string(),
            response_timeout: Duration::from_millis(500),
        });

        let err = ConfiguredStore::from_config(&config).await.err().unwrap();
        assert!(matches!(err, RatewardenError::Store(_)));
    }
}
