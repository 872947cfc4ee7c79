use crate::database::error::{DatabaseError, DbResult};
use crate::payments::types::Provider;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Raw provider callback, kept for audit and replay
#[derive(Debug, Clone, FromRow)]
pub struct PaymentCallback {
    pub id: Uuid,
    pub provider: String,
    pub provider_reference: Option<String>,
    pub payload: serde_json::Value,
    pub processed: bool,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub processed_at: Option<chrono::DateTime<chrono::Utc>>,
}

pub struct CallbackRepository {
    pool: PgPool,
}

impl CallbackRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Store a callback as received
    pub async fn log_event(
        &self,
        provider: Provider,
        provider_reference: Option<&str>,
        payload: serde_json::Value,
    ) -> DbResult<PaymentCallback> {
        sqlx::query_as::<_, PaymentCallback>(
            "INSERT INTO payment_callbacks (id, provider, provider_reference, payload, processed, attempts, created_at)
             VALUES ($1, $2, $3, $4, FALSE, 0, NOW())
             RETURNING id, provider, provider_reference, payload, processed, attempts, last_error, created_at, processed_at",
        )
        .bind(Uuid::new_v4())
        .bind(provider.as_str())
        .bind(provider_reference)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)
    }

    pub async fn mark_processed(&self, callback_id: Uuid) -> DbResult<()> {
        sqlx::query(
            "UPDATE payment_callbacks SET processed = TRUE, processed_at = NOW() WHERE id = $1",
        )
        .bind(callback_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    pub async fn record_failure(&self, callback_id: Uuid, error: &str) -> DbResult<()> {
        sqlx::query(
            "UPDATE payment_callbacks SET attempts = attempts + 1, last_error = $2 WHERE id = $1",
        )
        .bind(callback_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }
}
