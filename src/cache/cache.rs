//! Generic cache trait and Redis implementation
//!
//! Values are stored as JSON. Connection failures degrade to cache misses so a
//! Redis outage never fails a payment request.

use super::{error::CacheResult, RedisPool};
use async_trait::async_trait;
use bb8::PooledConnection;
use bb8_redis::RedisConnectionManager;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

type RedisConnection<'a> = PooledConnection<'a, RedisConnectionManager>;

/// Generic cache trait supporting any serializable type
#[async_trait]
pub trait Cache<T: Serialize + DeserializeOwned + Send + Sync + 'static> {
    /// Get a value from cache by key
    async fn get(&self, key: &str) -> CacheResult<Option<T>>;

    /// Set a value in cache with optional TTL
    async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> CacheResult<()>;

    /// Delete a value from cache
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Check if a key exists in cache
    async fn exists(&self, key: &str) -> CacheResult<bool>;
}

/// Redis implementation of the Cache trait
#[derive(Clone)]
pub struct RedisCache {
    pool: RedisPool,
}

impl RedisCache {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    async fn get_connection(&self) -> CacheResult<RedisConnection<'_>> {
        self.pool.get().await.map_err(|e| {
            warn!("Failed to get Redis connection: {}", e);
            e.into()
        })
    }
}

#[async_trait]
impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> Cache<T> for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<T>> {
        let mut conn = match self.get_connection().await {
            Ok(conn) => conn,
            Err(_) => return Ok(None),
        };

        let result: Option<String> = conn.get(key).await.map_err(|e| {
            warn!("Redis GET failed for key '{}': {}", key, e);
            e
        })?;

        match result {
            Some(json_str) => {
                let value: T = serde_json::from_str(&json_str).map_err(|e| {
                    warn!("Failed to deserialize cache value for key '{}': {}", key, e);
                    e
                })?;
                debug!("Cache hit for key: {}", key);
                Ok(Some(value))
            }
            None => {
                debug!("Cache miss for key: {}", key);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = match self.get_connection().await {
            Ok(conn) => conn,
            Err(_) => return Ok(()),
        };

        let json_str = serde_json::to_string(value)?;

        match ttl {
            Some(ttl) => {
                let _: () = conn.set_ex(key, json_str, ttl.as_secs()).await.map_err(|e| {
                    warn!("Redis SET_EX failed for key '{}': {}", key, e);
                    e
                })?;
            }
            None => {
                let _: () = conn.set(key, json_str).await.map_err(|e| {
                    warn!("Redis SET failed for key '{}': {}", key, e);
                    e
                })?;
            }
        }

        debug!("Cache set for key: {} (ttl: {:?})", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = match self.get_connection().await {
            Ok(conn) => conn,
            Err(_) => return Ok(false),
        };

        let removed: i32 = conn.del(key).await.map_err(|e| {
            warn!("Redis DEL failed for key '{}': {}", key, e);
            e
        })?;

        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = match self.get_connection().await {
            Ok(conn) => conn,
            Err(_) => return Ok(false),
        };

        let found: i32 = conn.exists(key).await.map_err(|e| {
            warn!("Redis EXISTS failed for key '{}': {}", key, e);
            e
        })?;

        Ok(found > 0)
    }
}

/// TTL constants for cached payment data
pub mod ttl {
    use std::time::Duration;

    /// Settled attempts never change again
    pub const FINAL_ATTEMPTS: Duration = Duration::from_secs(3600);
}
