//! Collaborator trait definitions
//!
//! The coordinator talks to gateways, the attempt store and the order store only
//! through these traits, so Postgres, Redis and HTTP stay swappable in tests.

use crate::database::error::DbResult;
use crate::payments::error::GatewayResult;
use crate::payments::types::{
    CallbackNotice, GatewayStatus, PaymentAttempt, Provider, PushRequest, Transition,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Trait for mobile-money gateway clients
///
/// M-Pesa and Airtel Money implement this trait so the coordinator can drive a
/// push and its status checks without knowing the provider's wire format.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Provider this client talks to
    fn provider(&self) -> Provider;

    /// Send a payment prompt to the customer's handset
    ///
    /// # Returns
    /// * `String` - Provider reference used to correlate later status checks
    async fn push(&self, request: &PushRequest) -> GatewayResult<String>;

    /// Query the current status of a push by its provider reference
    async fn check_status(&self, provider_reference: &str) -> GatewayResult<GatewayStatus>;

    /// Verify that a callback body came from the provider
    ///
    /// # Arguments
    /// * `payload` - Raw callback body
    /// * `signature` - Signature header, if the provider sent one
    fn validate_callback_signature(&self, payload: &[u8], signature: Option<&str>) -> bool;

    /// Extract the provider reference and reported outcome from a callback body
    fn parse_callback(&self, payload: &[u8]) -> GatewayResult<CallbackNotice>;
}

/// Persistent store of payment attempts
///
/// Every mutation is a conditional write so concurrent request handlers and the
/// sweeper can race safely.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Insert a new attempt unless the order already has one in a non-terminal state
    ///
    /// Returns `false` when the insert lost to an active attempt.
    async fn insert_if_no_active(&self, attempt: &PaymentAttempt) -> DbResult<bool>;

    async fn find_by_id(&self, attempt_id: Uuid) -> DbResult<Option<PaymentAttempt>>;

    async fn find_by_provider_reference(
        &self,
        provider: Provider,
        provider_reference: &str,
    ) -> DbResult<Option<PaymentAttempt>>;

    /// Compare-and-set on `state`
    ///
    /// Returns the updated attempt, or `None` when the current state was not
    /// `transition.from`.
    async fn transition(
        &self,
        attempt_id: Uuid,
        transition: &Transition,
    ) -> DbResult<Option<PaymentAttempt>>;

    /// Record a status check that left the attempt pending
    async fn touch(&self, attempt_id: Uuid, checked_at: DateTime<Utc>) -> DbResult<()>;

    /// Set the provider reference on an attempt that has none, whatever its state
    ///
    /// Keeps a push that was acknowledged after the attempt closed correlatable.
    /// Returns `false` when the attempt already carries a reference.
    async fn record_reference(&self, attempt_id: Uuid, provider_reference: &str) -> DbResult<bool>;

    /// Take the settlement lease on a completed, unsettled attempt
    ///
    /// Returns `false` when the attempt is settled or another lease is still live.
    /// The holder calls `mark_paid` and then `mark_settled`; a lease that is never
    /// released lapses at `now + lease`.
    async fn claim_settlement(
        &self,
        attempt_id: Uuid,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> DbResult<bool>;

    /// Give up a settlement lease after `mark_paid` failed
    async fn release_settlement(&self, attempt_id: Uuid) -> DbResult<()>;

    /// Record that the order store acknowledged `mark_paid`
    async fn mark_settled(&self, attempt_id: Uuid, settled_at: DateTime<Utc>) -> DbResult<()>;

    /// Non-terminal attempts whose deadline is at or before `now`
    async fn find_expired(&self, now: DateTime<Utc>, limit: i64)
        -> DbResult<Vec<PaymentAttempt>>;

    /// Completed attempts, resolved at or before `resolved_before`, whose order
    /// has not been marked paid
    async fn find_unsettled(
        &self,
        resolved_before: DateTime<Utc>,
        limit: i64,
    ) -> DbResult<Vec<PaymentAttempt>>;
}

/// The storefront's order store, as seen by the payment flow
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Outstanding total for the order, `None` when the order does not exist
    async fn get_due_amount(&self, order_id: &str) -> DbResult<Option<Decimal>>;

    /// Mark the order paid; calling it again for a paid order is a no-op
    async fn mark_paid(&self, order_id: &str) -> DbResult<()>;
}
