use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};

use crate::api::AppState;
use crate::payments::types::Provider;

#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub environment: String,
    pub database: String,
    pub cache: String,
    pub providers: Vec<Provider>,
}

fn component_status(configured: bool, healthy: bool) -> String {
    match (configured, healthy) {
        (false, _) => "disabled",
        (true, true) => "ok",
        (true, false) => "unavailable",
    }
    .to_string()
}

pub async fn health_check(
    State(state): State<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let version = env!("CARGO_PKG_VERSION").to_string();

    let database_ok = match &state.db {
        Some(pool) => crate::database::health_check(pool).await.is_ok(),
        None => true,
    };

    #[cfg(feature = "cache")]
    let (cache_configured, cache_ok) = match &state.cache {
        Some(pool) => (true, crate::cache::health_check(pool).await.is_ok()),
        None => (false, true),
    };
    #[cfg(not(feature = "cache"))]
    let (cache_configured, cache_ok) = (false, true);

    let providers: Vec<Provider> = [Provider::Mpesa, Provider::AirtelMoney]
        .into_iter()
        .filter(|p| state.coordinator.has_gateway(*p))
        .collect();

    // A Redis outage degrades caching only
    let healthy = database_ok;
    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        version,
        environment: state.environment.clone(),
        database: component_status(state.db.is_some(), database_ok),
        cache: component_status(cache_configured, cache_ok),
        providers,
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
