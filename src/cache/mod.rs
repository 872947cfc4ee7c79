//! Redis cache for payment attempts that can no longer change
//!
//! Status polls for finished attempts are the bulk of read traffic once a
//! checkout is over. Serving them from Redis keeps them off Postgres. The
//! cache is optional: every caller treats a Redis failure as a miss.

pub mod cache;
pub mod error;
pub mod keys;

pub use cache::{Cache, RedisCache};
pub use error::CacheError;

use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use std::time::Duration;
use tracing::{error, info, warn};

pub type RedisPool = Pool<RedisConnectionManager>;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
    pub min_idle: u32,
    /// Kept short: a poll waiting on Redis is slower than one going to Postgres
    pub connection_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl CacheConfig {
    /// Pool settings for the given Redis URL with default sizing
    pub fn for_url(redis_url: impl Into<String>) -> Self {
        Self {
            redis_url: redis_url.into(),
            ..Self::default()
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 8,
            min_idle: 1,
            connection_timeout: Duration::from_secs(2),
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Build the Redis pool used for attempt caching
///
/// An unreachable Redis at startup is logged, not fatal; connections are
/// retried lazily by the pool.
pub async fn init_cache_pool(config: CacheConfig) -> Result<RedisPool, CacheError> {
    let manager = RedisConnectionManager::new(config.redis_url.as_str()).map_err(|e| {
        error!(error = %e, "Invalid Redis URL for attempt cache");
        CacheError::ConnectionError(e.to_string())
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!(error = %e, "Could not build attempt cache pool");
            CacheError::ConnectionError(e.to_string())
        })?;

    match health_check(&pool).await {
        Ok(()) => info!(
            max_connections = config.max_connections,
            "Attempt cache connected"
        ),
        Err(e) => warn!(error = %e, "Attempt cache not reachable yet, polls will use Postgres"),
    }

    Ok(pool)
}

/// PING through a pooled connection
pub async fn health_check(pool: &RedisPool) -> Result<(), CacheError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|e| CacheError::ConnectionError(e.to_string()))?;

    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(())
}
