use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::payments::traits::AttemptStore;
use crate::payments::types::{AttemptState, PaymentAttempt, Provider, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

#[cfg(feature = "cache")]
use crate::cache::{keys::payment::AttemptKey, Cache, RedisCache};
#[cfg(feature = "cache")]
use tracing::debug;

const ATTEMPT_COLUMNS: &str = "attempt_id, order_id, provider, phone_number, amount, state, \
     provider_reference, provider_receipt, failure_reason, created_at, expires_at, \
     last_checked_at, resolved_at, settled_at";

/// Row shape of `payment_attempts`
#[derive(Debug, Clone, FromRow)]
pub struct PaymentAttemptRow {
    pub attempt_id: Uuid,
    pub order_id: String,
    pub provider: String,
    pub phone_number: String,
    pub amount: Decimal,
    pub state: String,
    pub provider_reference: Option<String>,
    pub provider_receipt: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl TryFrom<PaymentAttemptRow> for PaymentAttempt {
    type Error = DatabaseError;

    fn try_from(row: PaymentAttemptRow) -> Result<Self, Self::Error> {
        let provider = row.provider.parse::<Provider>().map_err(|_| {
            DatabaseError::new(DatabaseErrorKind::DecodeError {
                column: "provider".to_string(),
                value: row.provider.clone(),
            })
        })?;
        let state = AttemptState::from_db_status(&row.state).ok_or_else(|| {
            DatabaseError::new(DatabaseErrorKind::DecodeError {
                column: "state".to_string(),
                value: row.state.clone(),
            })
        })?;

        Ok(PaymentAttempt {
            attempt_id: row.attempt_id,
            order_id: row.order_id,
            provider,
            phone_number: row.phone_number,
            amount: row.amount,
            state,
            provider_reference: row.provider_reference,
            provider_receipt: row.provider_receipt,
            failure_reason: row.failure_reason,
            created_at: row.created_at,
            expires_at: row.expires_at,
            last_checked_at: row.last_checked_at,
            resolved_at: row.resolved_at,
            settled_at: row.settled_at,
        })
    }
}

fn into_attempts(rows: Vec<PaymentAttemptRow>) -> DbResult<Vec<PaymentAttempt>> {
    rows.into_iter().map(PaymentAttempt::try_from).collect()
}

/// Postgres-backed attempt store
///
/// One active attempt per order is enforced by the partial unique index
/// `payment_attempts_one_active_per_order`; state changes are conditional
/// `UPDATE ... WHERE state = $from`.
pub struct PaymentAttemptRepository {
    pool: PgPool,
    #[cfg(feature = "cache")]
    cache: Option<RedisCache>,
}

impl PaymentAttemptRepository {
    /// Create a new repository without caching
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            #[cfg(feature = "cache")]
            cache: None,
        }
    }

    /// Create a new repository with Redis caching of settled attempts
    #[cfg(feature = "cache")]
    pub fn with_cache(pool: PgPool, cache: RedisCache) -> Self {
        Self {
            pool,
            cache: Some(cache),
        }
    }

    /// Enable caching for an existing repository
    #[cfg(feature = "cache")]
    pub fn enable_cache(&mut self, cache: RedisCache) {
        self.cache = Some(cache);
    }

    /// Recent attempts for an order, newest first
    pub async fn find_by_order(&self, order_id: &str, limit: i64) -> DbResult<Vec<PaymentAttempt>> {
        let rows = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            "SELECT {} FROM payment_attempts WHERE order_id = $1
             ORDER BY created_at DESC LIMIT $2",
            ATTEMPT_COLUMNS
        ))
        .bind(order_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        into_attempts(rows)
    }

    #[cfg(feature = "cache")]
    async fn cache_if_final(&self, attempt: &PaymentAttempt) {
        let Some(ref cache) = self.cache else {
            return;
        };
        if !attempt.is_final() {
            return;
        }

        let key = AttemptKey::new(attempt.attempt_id);
        let ttl = crate::cache::cache::ttl::FINAL_ATTEMPTS;
        if let Err(e) = cache.set(&key.to_string(), attempt, Some(ttl)).await {
            debug!("Failed to cache payment attempt: {}", e);
        } else {
            debug!("Cached final payment attempt: {}", attempt.attempt_id);
        }
    }

    #[cfg(feature = "cache")]
    async fn invalidate(&self, attempt_id: Uuid) {
        if let Some(ref cache) = self.cache {
            let key = AttemptKey::new(attempt_id);
            if let Err(e) =
                <RedisCache as Cache<PaymentAttempt>>::delete(cache, &key.to_string()).await
            {
                debug!("Failed to invalidate payment attempt cache: {}", e);
            }
        }
    }
}

#[async_trait]
impl AttemptStore for PaymentAttemptRepository {
    async fn insert_if_no_active(&self, attempt: &PaymentAttempt) -> DbResult<bool> {
        let result = sqlx::query(
            "INSERT INTO payment_attempts
                (attempt_id, order_id, provider, phone_number, amount, state, created_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(attempt.attempt_id)
        .bind(&attempt.order_id)
        .bind(attempt.provider.as_str())
        .bind(&attempt.phone_number)
        .bind(attempt.amount)
        .bind(attempt.state.as_str())
        .bind(attempt.created_at)
        .bind(attempt.expires_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                let err = DatabaseError::from_sqlx(e);
                if err.is_unique_violation() {
                    Ok(false)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn find_by_id(&self, attempt_id: Uuid) -> DbResult<Option<PaymentAttempt>> {
        #[cfg(feature = "cache")]
        if let Some(ref cache) = self.cache {
            let key = AttemptKey::new(attempt_id);
            if let Ok(Some(cached)) =
                <RedisCache as Cache<PaymentAttempt>>::get(cache, &key.to_string()).await
            {
                debug!("Cache hit for payment attempt: {}", attempt_id);
                return Ok(Some(cached));
            }
        }

        let row = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            "SELECT {} FROM payment_attempts WHERE attempt_id = $1",
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        let attempt = row.map(PaymentAttempt::try_from).transpose()?;

        #[cfg(feature = "cache")]
        if let Some(ref attempt) = attempt {
            self.cache_if_final(attempt).await;
        }

        Ok(attempt)
    }

    async fn find_by_provider_reference(
        &self,
        provider: Provider,
        provider_reference: &str,
    ) -> DbResult<Option<PaymentAttempt>> {
        let row = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            "SELECT {} FROM payment_attempts WHERE provider = $1 AND provider_reference = $2",
            ATTEMPT_COLUMNS
        ))
        .bind(provider.as_str())
        .bind(provider_reference)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        row.map(PaymentAttempt::try_from).transpose()
    }

    async fn transition(
        &self,
        attempt_id: Uuid,
        transition: &Transition,
    ) -> DbResult<Option<PaymentAttempt>> {
        if !transition.from.can_transition_to(transition.to) {
            return Ok(None);
        }

        let resolved_at = transition.to.is_terminal().then_some(transition.at);
        let row = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            "UPDATE payment_attempts
             SET state = $3,
                 provider_reference = COALESCE($4, provider_reference),
                 provider_receipt = COALESCE($5, provider_receipt),
                 failure_reason = COALESCE($6, failure_reason),
                 resolved_at = COALESCE($7, resolved_at)
             WHERE attempt_id = $1 AND state = $2
             RETURNING {}",
            ATTEMPT_COLUMNS
        ))
        .bind(attempt_id)
        .bind(transition.from.as_str())
        .bind(transition.to.as_str())
        .bind(&transition.provider_reference)
        .bind(&transition.provider_receipt)
        .bind(&transition.failure_reason)
        .bind(resolved_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        match row {
            Some(row) => {
                let attempt = PaymentAttempt::try_from(row)?;
                #[cfg(feature = "cache")]
                self.cache_if_final(&attempt).await;
                Ok(Some(attempt))
            }
            None => {
                let exists: Option<(Uuid,)> =
                    sqlx::query_as("SELECT attempt_id FROM payment_attempts WHERE attempt_id = $1")
                        .bind(attempt_id)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(DatabaseError::from_sqlx)?;
                match exists {
                    Some(_) => Ok(None),
                    None => Err(DatabaseError::not_found("PaymentAttempt", attempt_id)),
                }
            }
        }
    }

    async fn touch(&self, attempt_id: Uuid, checked_at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("UPDATE payment_attempts SET last_checked_at = $2 WHERE attempt_id = $1")
            .bind(attempt_id)
            .bind(checked_at)
            .execute(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn record_reference(&self, attempt_id: Uuid, provider_reference: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_attempts SET provider_reference = $2
             WHERE attempt_id = $1 AND provider_reference IS NULL",
        )
        .bind(attempt_id)
        .bind(provider_reference)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        #[cfg(feature = "cache")]
        self.invalidate(attempt_id).await;

        Ok(result.rows_affected() > 0)
    }

    async fn claim_settlement(
        &self,
        attempt_id: Uuid,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE payment_attempts SET settle_claimed_until = $3
             WHERE attempt_id = $1
               AND state = 'completed'
               AND settled_at IS NULL
               AND (settle_claimed_until IS NULL OR settle_claimed_until <= $2)",
        )
        .bind(attempt_id)
        .bind(now)
        .bind(now + lease)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_settlement(&self, attempt_id: Uuid) -> DbResult<()> {
        sqlx::query(
            "UPDATE payment_attempts SET settle_claimed_until = NULL
             WHERE attempt_id = $1 AND settled_at IS NULL",
        )
        .bind(attempt_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    async fn mark_settled(&self, attempt_id: Uuid, settled_at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query(
            "UPDATE payment_attempts
             SET settled_at = COALESCE(settled_at, $2), settle_claimed_until = NULL
             WHERE attempt_id = $1",
        )
        .bind(attempt_id)
        .bind(settled_at)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        #[cfg(feature = "cache")]
        self.invalidate(attempt_id).await;

        Ok(())
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<PaymentAttempt>> {
        let rows = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            "SELECT {} FROM payment_attempts
             WHERE state IN ('initiated', 'awaiting_confirmation') AND expires_at <= $1
             ORDER BY expires_at ASC LIMIT $2",
            ATTEMPT_COLUMNS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        into_attempts(rows)
    }

    async fn find_unsettled(
        &self,
        resolved_before: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<PaymentAttempt>> {
        let rows = sqlx::query_as::<_, PaymentAttemptRow>(&format!(
            "SELECT {} FROM payment_attempts
             WHERE state = 'completed' AND settled_at IS NULL AND resolved_at <= $1
             ORDER BY resolved_at ASC LIMIT $2",
            ATTEMPT_COLUMNS
        ))
        .bind(resolved_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        into_attempts(rows)
    }
}
