use crate::database::error::{DatabaseError, DatabaseErrorKind, DbResult};
use crate::payments::traits::{AttemptStore, OrderStore};
use crate::payments::types::{PaymentAttempt, Provider, Transition};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A thread-safe in-memory attempt store.
///
/// Every operation runs under one write lock, which gives the same
/// compare-and-set guarantees as the conditional writes of the Postgres store.
#[derive(Default, Clone)]
pub struct InMemoryAttemptStore {
    attempts: Arc<RwLock<HashMap<Uuid, PaymentAttempt>>>,
    settle_leases: Arc<RwLock<HashMap<Uuid, DateTime<Utc>>>>,
    failing_transitions: Arc<AtomicUsize>,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.attempts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.attempts.read().await.is_empty()
    }

    /// Make the next `count` calls to `transition` fail with a connection error
    pub fn fail_next_transitions(&self, count: usize) {
        self.failing_transitions.store(count, Ordering::SeqCst);
    }

    fn take_transition_failure(&self) -> DbResult<()> {
        let failing = self
            .failing_transitions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(DatabaseError::new(DatabaseErrorKind::ConnectionError {
                message: "attempt store unavailable".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn insert_if_no_active(&self, attempt: &PaymentAttempt) -> DbResult<bool> {
        let mut attempts = self.attempts.write().await;
        let active = attempts
            .values()
            .any(|a| a.order_id == attempt.order_id && !a.state.is_terminal());
        if active {
            return Ok(false);
        }
        attempts.insert(attempt.attempt_id, attempt.clone());
        Ok(true)
    }

    async fn find_by_id(&self, attempt_id: Uuid) -> DbResult<Option<PaymentAttempt>> {
        Ok(self.attempts.read().await.get(&attempt_id).cloned())
    }

    async fn find_by_provider_reference(
        &self,
        provider: Provider,
        provider_reference: &str,
    ) -> DbResult<Option<PaymentAttempt>> {
        let attempts = self.attempts.read().await;
        Ok(attempts
            .values()
            .find(|a| {
                a.provider == provider
                    && a.provider_reference.as_deref() == Some(provider_reference)
            })
            .cloned())
    }

    async fn transition(
        &self,
        attempt_id: Uuid,
        transition: &Transition,
    ) -> DbResult<Option<PaymentAttempt>> {
        self.take_transition_failure()?;
        let mut attempts = self.attempts.write().await;
        let attempt = attempts.get_mut(&attempt_id).ok_or_else(|| {
            DatabaseError::new(DatabaseErrorKind::NotFound {
                entity: "PaymentAttempt".to_string(),
                id: attempt_id.to_string(),
            })
        })?;

        if attempt.state != transition.from || !transition.from.can_transition_to(transition.to)
        {
            return Ok(None);
        }
        transition.apply(attempt);
        Ok(Some(attempt.clone()))
    }

    async fn touch(&self, attempt_id: Uuid, checked_at: DateTime<Utc>) -> DbResult<()> {
        if let Some(attempt) = self.attempts.write().await.get_mut(&attempt_id) {
            attempt.last_checked_at = Some(checked_at);
        }
        Ok(())
    }

    async fn record_reference(&self, attempt_id: Uuid, provider_reference: &str) -> DbResult<bool> {
        let mut attempts = self.attempts.write().await;
        match attempts.get_mut(&attempt_id) {
            Some(attempt) if attempt.provider_reference.is_none() => {
                attempt.provider_reference = Some(provider_reference.to_string());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_settlement(
        &self,
        attempt_id: Uuid,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> DbResult<bool> {
        // Lock order: attempts, then leases
        let attempts = self.attempts.read().await;
        let mut leases = self.settle_leases.write().await;

        let Some(attempt) = attempts.get(&attempt_id) else {
            return Ok(false);
        };
        if !attempt.needs_settlement() {
            return Ok(false);
        }
        if leases.get(&attempt_id).is_some_and(|until| *until > now) {
            return Ok(false);
        }
        leases.insert(attempt_id, now + lease);
        Ok(true)
    }

    async fn release_settlement(&self, attempt_id: Uuid) -> DbResult<()> {
        self.settle_leases.write().await.remove(&attempt_id);
        Ok(())
    }

    async fn mark_settled(&self, attempt_id: Uuid, settled_at: DateTime<Utc>) -> DbResult<()> {
        let mut attempts = self.attempts.write().await;
        if let Some(attempt) = attempts.get_mut(&attempt_id) {
            attempt.settled_at.get_or_insert(settled_at);
        }
        self.settle_leases.write().await.remove(&attempt_id);
        Ok(())
    }

    async fn find_expired(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<PaymentAttempt>> {
        let attempts = self.attempts.read().await;
        let mut expired: Vec<PaymentAttempt> = attempts
            .values()
            .filter(|a| !a.state.is_terminal() && a.is_expired_at(now))
            .cloned()
            .collect();
        expired.sort_by_key(|a| a.expires_at);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn find_unsettled(
        &self,
        resolved_before: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<PaymentAttempt>> {
        let attempts = self.attempts.read().await;
        let mut unsettled: Vec<PaymentAttempt> = attempts
            .values()
            .filter(|a| {
                a.needs_settlement() && a.resolved_at.is_some_and(|at| at <= resolved_before)
            })
            .cloned()
            .collect();
        unsettled.sort_by_key(|a| a.resolved_at);
        unsettled.truncate(limit.max(0) as usize);
        Ok(unsettled)
    }
}

#[derive(Debug, Clone)]
struct OrderRecord {
    due: Decimal,
    paid: bool,
    mark_paid_calls: usize,
}

/// In-memory order store that counts `mark_paid` calls
#[derive(Default, Clone)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<String, OrderRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_order(&self, order_id: impl Into<String>, due: Decimal) {
        self.orders.write().await.insert(
            order_id.into(),
            OrderRecord {
                due,
                paid: false,
                mark_paid_calls: 0,
            },
        );
    }

    pub async fn is_paid(&self, order_id: &str) -> bool {
        self.orders
            .read()
            .await
            .get(order_id)
            .map(|o| o.paid)
            .unwrap_or(false)
    }

    pub async fn mark_paid_count(&self, order_id: &str) -> usize {
        self.orders
            .read()
            .await
            .get(order_id)
            .map(|o| o.mark_paid_calls)
            .unwrap_or(0)
    }

    /// Make every call fail with a connection error until switched back
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> DbResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DatabaseError::new(DatabaseErrorKind::ConnectionError {
                message: "order store unavailable".to_string(),
            }));
        }
        Ok(())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn get_due_amount(&self, order_id: &str) -> DbResult<Option<Decimal>> {
        self.check_available()?;
        Ok(self
            .orders
            .read()
            .await
            .get(order_id)
            .map(|o| if o.paid { Decimal::ZERO } else { o.due }))
    }

    async fn mark_paid(&self, order_id: &str) -> DbResult<()> {
        self.check_available()?;
        let mut orders = self.orders.write().await;
        let order = orders.get_mut(order_id).ok_or_else(|| {
            DatabaseError::new(DatabaseErrorKind::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            })
        })?;
        order.mark_paid_calls += 1;
        order.paid = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::AttemptState;
    use rust_decimal_macros::dec;

    fn attempt(order_id: &str, now: DateTime<Utc>) -> PaymentAttempt {
        PaymentAttempt::new(
            order_id,
            Provider::Mpesa,
            "0712345678",
            dec!(100),
            now,
            chrono::Duration::seconds(120),
        )
    }

    #[tokio::test]
    async fn test_insert_rejects_second_active_attempt() {
        let store = InMemoryAttemptStore::new();
        let now = Utc::now();
        assert!(store.insert_if_no_active(&attempt("O1", now)).await.unwrap());
        assert!(!store.insert_if_no_active(&attempt("O1", now)).await.unwrap());
        assert!(store.insert_if_no_active(&attempt("O2", now)).await.unwrap());
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_insert_allowed_after_terminal() {
        let store = InMemoryAttemptStore::new();
        let now = Utc::now();
        let first = attempt("O1", now);
        store.insert_if_no_active(&first).await.unwrap();
        store
            .transition(
                first.attempt_id,
                &Transition::new(AttemptState::Initiated, AttemptState::Failed, now),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(store.insert_if_no_active(&attempt("O1", now)).await.unwrap());
    }

    #[tokio::test]
    async fn test_transition_compare_and_set() {
        let store = InMemoryAttemptStore::new();
        let now = Utc::now();
        let a = attempt("O1", now);
        store.insert_if_no_active(&a).await.unwrap();

        let stale = Transition::new(
            AttemptState::AwaitingConfirmation,
            AttemptState::Completed,
            now,
        );
        assert!(store.transition(a.attempt_id, &stale).await.unwrap().is_none());

        let valid = Transition::new(AttemptState::Initiated, AttemptState::AwaitingConfirmation, now)
            .with_reference("ref-1");
        let updated = store.transition(a.attempt_id, &valid).await.unwrap().unwrap();
        assert_eq!(updated.state, AttemptState::AwaitingConfirmation);

        let found = store
            .find_by_provider_reference(Provider::Mpesa, "ref-1")
            .await
            .unwrap();
        assert_eq!(found.map(|f| f.attempt_id), Some(a.attempt_id));
        assert!(store
            .find_by_provider_reference(Provider::AirtelMoney, "ref-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_find_expired_skips_terminal_and_fresh() {
        let store = InMemoryAttemptStore::new();
        let now = Utc::now();
        let old = attempt("O1", now - chrono::Duration::seconds(300));
        let fresh = attempt("O2", now);
        store.insert_if_no_active(&old).await.unwrap();
        store.insert_if_no_active(&fresh).await.unwrap();

        let expired = store.find_expired(now, 10).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].attempt_id, old.attempt_id);
    }

    #[tokio::test]
    async fn test_order_store_unavailable() {
        let orders = InMemoryOrderStore::new();
        orders.insert_order("O1", dec!(10)).await;
        orders.set_unavailable(true);
        assert!(orders.mark_paid("O1").await.unwrap_err().is_retryable());
        orders.set_unavailable(false);
        orders.mark_paid("O1").await.unwrap();
        assert!(orders.is_paid("O1").await);
        assert_eq!(orders.mark_paid_count("O1").await, 1);
    }

    #[tokio::test]
    async fn test_paid_order_owes_nothing() {
        let orders = InMemoryOrderStore::new();
        orders.insert_order("O1", dec!(1500)).await;
        assert_eq!(orders.get_due_amount("O1").await.unwrap(), Some(dec!(1500)));

        orders.mark_paid("O1").await.unwrap();
        assert_eq!(orders.get_due_amount("O1").await.unwrap(), Some(Decimal::ZERO));
        assert_eq!(orders.get_due_amount("O2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_record_reference_only_fills_missing() {
        let store = InMemoryAttemptStore::new();
        let now = Utc::now();
        let a = attempt("O1", now);
        store.insert_if_no_active(&a).await.unwrap();
        store
            .transition(
                a.attempt_id,
                &Transition::new(AttemptState::Initiated, AttemptState::TimedOut, now),
            )
            .await
            .unwrap()
            .unwrap();

        assert!(store.record_reference(a.attempt_id, "ref-late").await.unwrap());
        assert!(!store.record_reference(a.attempt_id, "ref-other").await.unwrap());

        let found = store
            .find_by_provider_reference(Provider::Mpesa, "ref-late")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.state, AttemptState::TimedOut);
    }

    #[tokio::test]
    async fn test_settlement_lease_is_exclusive_until_it_lapses() {
        let store = InMemoryAttemptStore::new();
        let now = Utc::now();
        let lease = chrono::Duration::seconds(60);
        let a = attempt("O1", now);
        store.insert_if_no_active(&a).await.unwrap();
        for (from, to) in [
            (AttemptState::Initiated, AttemptState::AwaitingConfirmation),
            (AttemptState::AwaitingConfirmation, AttemptState::Completed),
        ] {
            store
                .transition(a.attempt_id, &Transition::new(from, to, now))
                .await
                .unwrap()
                .unwrap();
        }

        assert!(store.claim_settlement(a.attempt_id, now, lease).await.unwrap());
        assert!(!store.claim_settlement(a.attempt_id, now, lease).await.unwrap());
        assert!(store
            .claim_settlement(a.attempt_id, now + lease, lease)
            .await
            .unwrap());

        store.release_settlement(a.attempt_id).await.unwrap();
        assert!(store.claim_settlement(a.attempt_id, now, lease).await.unwrap());

        store.mark_settled(a.attempt_id, now).await.unwrap();
        assert!(!store
            .claim_settlement(a.attempt_id, now + lease * 3, lease)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_injected_transition_failures() {
        let store = InMemoryAttemptStore::new();
        let now = Utc::now();
        let a = attempt("O1", now);
        store.insert_if_no_active(&a).await.unwrap();
        store.fail_next_transitions(1);

        let transition = Transition::new(AttemptState::Initiated, AttemptState::Failed, now);
        assert!(store.transition(a.attempt_id, &transition).await.unwrap_err().is_retryable());
        assert!(store.transition(a.attempt_id, &transition).await.unwrap().is_some());
    }
}
