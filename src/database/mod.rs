pub mod attempt_repository;
pub mod callback_repository;
pub mod error;
pub mod order_repository;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::{error as log_error, info, warn};

use self::error::DatabaseError;

/// Postgres pool sizing
///
/// Every request does a handful of short queries and the sweeper holds at
/// most one connection per pass, so the pool stays small.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a request waits for a free connection before failing with 500
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
}

impl PoolConfig {
    pub fn with_max_connections(max_connections: u32) -> Self {
        Self {
            max_connections,
            min_connections: Self::default().min_connections.min(max_connections),
            ..Self::default()
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(600),
            max_lifetime: Duration::from_secs(1800),
        }
    }
}

/// Connect to the attempts and orders database
pub async fn init_pool(
    database_url: &str,
    config: Option<PoolConfig>,
) -> Result<PgPool, DatabaseError> {
    let config = config.unwrap_or_default();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(config.acquire_timeout)
        .idle_timeout(config.idle_timeout)
        .max_lifetime(config.max_lifetime)
        .connect(database_url)
        .await
        .map_err(|e| {
            log_error!(error = %e, "Could not connect to the payments database");
            DatabaseError::from_sqlx(e)
        })?;

    info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Payments database connected"
    );
    Ok(pool)
}

/// Create or upgrade the `orders`, `payment_attempts` and `payment_callbacks` tables
pub async fn run_migrations(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::migrate!("./migrations").run(pool).await.map_err(|e| {
        log_error!(error = %e, "Payments schema migration failed");
        DatabaseError::from_sqlx(e.into())
    })?;
    info!("Payments schema is up to date");
    Ok(())
}

/// `SELECT 1` through the pool, used by `/health`
pub async fn health_check(pool: &PgPool) -> Result<(), DatabaseError> {
    sqlx::query("SELECT 1").execute(pool).await.map_err(|e| {
        warn!(error = %e, "Payments database health check failed");
        DatabaseError::from_sqlx(e)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires database running
    async fn test_pool_initialization() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = init_pool(&url, Some(PoolConfig::default())).await.unwrap();
        assert!(health_check(&pool).await.is_ok());
    }

    #[test]
    fn test_pool_config_sizing() {
        let config = PoolConfig::with_max_connections(25);
        assert_eq!(config.max_connections, 25);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.acquire_timeout, Duration::from_secs(10));

        // Never keep more idle connections than the pool may hold
        let tiny = PoolConfig::with_max_connections(1);
        assert_eq!(tiny.min_connections, 1);
    }
}
