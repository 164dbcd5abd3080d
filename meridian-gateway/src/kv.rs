//! KV surface: `logical_model:<id>`, `provider:health:<id>`,
//! `keypool:<provider>:<keyhash>:qps`/`:cooldown_until`, `routing:<logical>:provider_weights`,
//! `session:<conv>`. One trait, two implementations: a Redis-backed one for
//! production and a `dashmap`-backed one for tests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    /// Atomic increment, used for the per-key sliding QPS window.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, KvError>;
}

#[async_trait::async_trait]
pub trait KvStoreExt: KvStore {
    async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, KvError> {
        match self.get_raw(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let raw = serde_json::to_string(value)?;
        self.set_raw(key, raw, ttl).await
    }
}

impl<T: KvStore + ?Sized> KvStoreExt for T {}

struct Entry {
    value: String,
    expires_at: Option<std::time::Instant>,
}

/// In-memory KV used for tests and single-process deployments. Expiry is
/// checked lazily on read, matching Redis's own passive-expiry behavior
/// closely enough for test purposes.
#[derive(Default)]
pub struct InMemoryKv {
    entries: DashMap<String, Entry>,
}

impl InMemoryKv {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, KvError> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at.map(|e| e > std::time::Instant::now()).unwrap_or(true) {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove(key);
        Ok(None)
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KvError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| std::time::Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: Some(std::time::Instant::now() + ttl),
        });
        let current: i64 = entry.value.parse().unwrap_or(0);
        let next = current + 1;
        entry.value = next.to_string();
        Ok(next)
    }
}

/// Redis-backed implementation for multi-process deployments. Connections
/// are pooled by `redis`'s own multiplexed connection manager.
pub struct RedisKv {
    client: redis::Client,
}

impl RedisKv {
    pub fn new(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<redis::aio::MultiplexedConnection, KvError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| KvError::Backend(e.to_string()))
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get_raw(&self, key: &str) -> Result<Option<String>, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn set_raw(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        match ttl {
            Some(d) => conn
                .set_ex::<_, _, ()>(key, value, d.as_secs().max(1))
                .await
                .map_err(|e| KvError::Backend(e.to_string())),
            None => conn
                .set::<_, _, ()>(key, value)
                .await
                .map_err(|e| KvError::Backend(e.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(key).await.map_err(|e| KvError::Backend(e.to_string()))
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64, KvError> {
        use redis::AsyncCommands;
        let mut conn = self.conn().await?;
        let count: i64 = conn.incr(key, 1).await.map_err(|e| KvError::Backend(e.to_string()))?;
        if count == 1 {
            let _: () = conn
                .expire(key, ttl.as_secs().max(1) as i64)
                .await
                .map_err(|e| KvError::Backend(e.to_string()))?;
        }
        Ok(count)
    }
}

pub mod keys {
    pub fn logical_model(id: &str) -> String {
        format!("logical_model:{id}")
    }
    pub fn provider_health(id: &str) -> String {
        format!("provider:health:{id}")
    }
    pub fn keypool_qps(provider: &str, key_hash: &str) -> String {
        format!("keypool:{provider}:{key_hash}:qps")
    }
    pub fn keypool_cooldown(provider: &str, key_hash: &str) -> String {
        format!("keypool:{provider}:{key_hash}:cooldown_until")
    }
    pub fn provider_cooldown(provider: &str) -> String {
        format!("keypool:{provider}:provider_cooldown_until")
    }
    pub fn provider_qps(provider: &str) -> String {
        format!("keypool:{provider}:provider_qps")
    }
    pub fn routing_weights(logical: &str) -> String {
        format!("routing:{logical}:provider_weights")
    }
    pub fn session(conversation_id: &str) -> String {
        format!("session:{conversation_id}")
    }
}
