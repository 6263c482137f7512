//! Keyed state store for request metadata and response records.
//!
//! The worker that pulled a message is the single writer for its keys;
//! readers are the query handlers. Records carry a TTL so abandoned
//! requests expire on their own.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{CacheSettings, CacheType};
use crate::error::{RelayError, Result};

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: &Value, ttl_seconds: Option<u64>) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn health_check(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Create the configured state store implementation.
pub async fn create_store(settings: &CacheSettings) -> Result<Arc<dyn StateStore>> {
    match settings.cache_type {
        CacheType::Redis => Ok(Arc::new(RedisStore::connect(&settings.redis_url).await?)),
        CacheType::Memory => Ok(Arc::new(MemoryStore::new())),
    }
}

/// Redis-backed store using a shared connection manager.
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| RelayError::store(format!("invalid redis url: {}", e)))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| RelayError::store(format!("failed to connect to redis: {}", e)))?;
        info!("Connected to redis state store at {}", url);
        Ok(Self { manager })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl_seconds: Option<u64>) -> Result<()> {
        let mut conn = self.manager.clone();
        let body = serde_json::to_string(value)?;
        match ttl_seconds {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(key)
                    .arg(&body)
                    .arg("EX")
                    .arg(ttl)
                    .query_async::<_, ()>(&mut conn)
                    .await?;
            }
            None => {
                conn.set::<_, _, ()>(key, &body).await?;
            }
        }
        debug!("Stored key {} (ttl: {:?})", key, ttl_seconds);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        Ok(conn.exists(key).await?)
    }

    async fn health_check(&self) -> bool {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .is_ok()
    }

    async fn close(&self) -> Result<()> {
        // The connection manager closes with its last clone.
        Ok(())
    }
}

struct MemoryEntry {
    value: Value,
    expires_at: Option<Instant>,
}

/// In-process store used by tests and single-node development setups.
#[derive(Default)]
pub struct MemoryStore {
    entries: parking_lot::Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_expired(entry: &MemoryEntry) -> bool {
        entry.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if Self::is_expired(entry) => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &Value, ttl_seconds: Option<u64>) -> Result<()> {
        let expires_at = ttl_seconds.map(|ttl| Instant::now() + Duration::from_secs(ttl));
        self.entries.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
