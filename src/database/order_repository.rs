use crate::database::error::{DatabaseError, DbResult};
use crate::payments::traits::OrderStore;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::info;

/// Storefront `orders` table, limited to what the payment flow reads and writes
pub struct OrderRepository {
    pool: PgPool,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderStore for OrderRepository {
    async fn get_due_amount(&self, order_id: &str) -> DbResult<Option<Decimal>> {
        // A paid order owes nothing
        let row: Option<(Decimal,)> = sqlx::query_as(
            "SELECT CASE WHEN is_paid THEN 0 ELSE total_amount END
             FROM orders WHERE id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        Ok(row.map(|(amount,)| amount))
    }

    async fn mark_paid(&self, order_id: &str) -> DbResult<()> {
        let result = sqlx::query(
            "UPDATE orders SET is_paid = TRUE, paid_at = COALESCE(paid_at, NOW())
             WHERE id = $1",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(DatabaseError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::not_found("Order", order_id));
        }

        info!(order_id = %order_id, "Order marked paid");
        Ok(())
    }
}
