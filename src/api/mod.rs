pub mod health;
pub mod payments;

use crate::database::callback_repository::CallbackRepository;
use crate::payments::PaymentConfirmationCoordinator;
use axum::routing::{get, post};
use axum::Router;
use sqlx::PgPool;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[cfg(feature = "cache")]
use crate::cache::RedisPool;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<PaymentConfirmationCoordinator>,
    /// Raw callback log; absent when running without Postgres
    pub callbacks: Option<Arc<CallbackRepository>>,
    pub db: Option<PgPool>,
    #[cfg(feature = "cache")]
    pub cache: Option<RedisPool>,
    pub environment: String,
}

impl AppState {
    pub fn new(coordinator: Arc<PaymentConfirmationCoordinator>, environment: impl Into<String>) -> Self {
        Self {
            coordinator,
            callbacks: None,
            db: None,
            #[cfg(feature = "cache")]
            cache: None,
            environment: environment.into(),
        }
    }

    pub fn with_database(mut self, pool: PgPool) -> Self {
        self.callbacks = Some(Arc::new(CallbackRepository::new(pool.clone())));
        self.db = Some(pool);
        self
    }

    #[cfg(feature = "cache")]
    pub fn with_cache(mut self, pool: RedisPool) -> Self {
        self.cache = Some(pool);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/payments", post(payments::initiate_payment))
        .route("/api/payments/:attempt_id", get(payments::get_payment_status))
        .route("/api/payments/callbacks/mpesa", post(payments::mpesa_callback))
        .route("/api/payments/callbacks/airtel", post(payments::airtel_callback))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
        .with_state(state)
}
