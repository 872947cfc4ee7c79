use anyhow::Context;
use kahawa_payments::api::{self, AppState};
use kahawa_payments::config::Config;
use kahawa_payments::database::{
    self, attempt_repository::PaymentAttemptRepository, order_repository::OrderRepository,
    PoolConfig,
};
use kahawa_payments::payments::providers::{AirtelGateway, MpesaGateway};
use kahawa_payments::payments::{
    CoordinatorConfig, PaymentConfirmationCoordinator, SweeperConfig, TimeoutSweeper,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=info,sqlx=warn"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(config.server.json_logs);

    tracing::info!("Starting Kahawa payments service");
    tracing::info!("Environment: {}", config.server.environment);

    let pool = database::init_pool(
        &config.database.url,
        Some(PoolConfig::with_max_connections(
            config.database.max_connections,
        )),
    )
    .await
    .context("failed to connect to Postgres")?;

    if config.database.run_migrations {
        database::run_migrations(&pool).await?;
    }

    #[allow(unused_mut)]
    let mut attempts = PaymentAttemptRepository::new(pool.clone());

    #[cfg(feature = "cache")]
    let cache_pool = match &config.redis {
        Some(redis) => {
            let cache_config = kahawa_payments::cache::CacheConfig::for_url(redis.url.as_str());
            match kahawa_payments::cache::init_cache_pool(cache_config).await {
                Ok(cache_pool) => {
                    attempts.enable_cache(kahawa_payments::cache::RedisCache::new(
                        cache_pool.clone(),
                    ));
                    Some(cache_pool)
                }
                Err(e) => {
                    tracing::warn!("Redis unavailable, continuing without cache: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    let mut coordinator = PaymentConfirmationCoordinator::new(
        Arc::new(attempts),
        Arc::new(OrderRepository::new(pool.clone())),
        CoordinatorConfig {
            confirmation_window: config.payments.confirmation_window(),
            push_timeout: config.payments.push_timeout(),
        },
    );

    if let Some(mpesa) = config.mpesa.clone() {
        coordinator = coordinator.with_gateway(Arc::new(MpesaGateway::new(mpesa)?));
    }
    if let Some(airtel) = config.airtel.clone() {
        coordinator = coordinator.with_gateway(Arc::new(AirtelGateway::new(airtel)?));
    }
    let coordinator = Arc::new(coordinator);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = TimeoutSweeper::new(
        coordinator.clone(),
        SweeperConfig {
            interval: config.payments.sweep_interval(),
            batch_size: config.payments.sweep_batch_size,
            settle_grace: config.payments.settle_grace(),
        },
    )
    .spawn(shutdown_rx);

    #[allow(unused_mut)]
    let mut state = AppState::new(coordinator, config.server.environment.clone())
        .with_database(pool.clone());
    #[cfg(feature = "cache")]
    if let Some(cache_pool) = cache_pool {
        state = state.with_cache(cache_pool);
    }

    let app = api::router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("HOST and PORT must form a valid socket address")?;
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::error!("Timeout sweeper task failed: {}", e);
    }
    pool.close().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
