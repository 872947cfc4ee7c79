//! Payment Confirmation Coordinator
//!
//! Drives one mobile-money attempt from the push to a terminal state. The
//! attempt record in the store is the only source of truth: every state change
//! is a compare-and-set against it, so request handlers on several processes,
//! provider callbacks and the timeout sweep can race without a lock.

use crate::payments::clock::{Clock, SystemClock};
use crate::payments::error::{GatewayError, PaymentError, PaymentResult};
use crate::payments::traits::{AttemptStore, OrderStore, PaymentGateway};
use crate::payments::types::{
    AttemptState, GatewayStatus, PaymentAttempt, Provider, PushRequest, Transition,
};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a settlement claim keeps other callers off `mark_paid`
const SETTLE_LEASE_SECS: i64 = 60;

/// Coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long the customer has to confirm the prompt, measured from initiation
    pub confirmation_window: Duration,
    /// Upper bound on one push including the client's own retries; kept below
    /// the window so a slow gateway cannot outlive the attempt
    pub push_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            confirmation_window: Duration::from_secs(120),
            push_timeout: Duration::from_secs(60),
        }
    }
}

pub struct PaymentConfirmationCoordinator {
    gateways: HashMap<Provider, Arc<dyn PaymentGateway>>,
    attempts: Arc<dyn AttemptStore>,
    orders: Arc<dyn OrderStore>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
}

impl PaymentConfirmationCoordinator {
    pub fn new(
        attempts: Arc<dyn AttemptStore>,
        orders: Arc<dyn OrderStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            gateways: HashMap::new(),
            attempts,
            orders,
            clock: Arc::new(SystemClock),
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Register a gateway; a later registration for the same provider replaces it
    pub fn with_gateway(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.gateways.insert(gateway.provider(), gateway);
        self
    }

    pub fn has_gateway(&self, provider: Provider) -> bool {
        self.gateways.contains_key(&provider)
    }

    pub fn attempts(&self) -> &Arc<dyn AttemptStore> {
        &self.attempts
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub fn gateway(&self, provider: Provider) -> PaymentResult<&Arc<dyn PaymentGateway>> {
        self.gateways
            .get(&provider)
            .ok_or(PaymentError::ProviderUnavailable(provider))
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.confirmation_window.as_secs() as i64)
    }

    /// Start a payment for an order and push the prompt to the customer
    pub async fn initiate(
        &self,
        order_id: &str,
        provider: Provider,
        phone_number: &str,
        amount: Decimal,
    ) -> PaymentResult<Uuid> {
        if amount <= Decimal::ZERO {
            return Err(PaymentError::invalid_amount(
                amount,
                "amount must be greater than zero",
            ));
        }

        let gateway = self.gateway(provider)?;

        let due = self
            .orders
            .get_due_amount(order_id)
            .await?
            .ok_or_else(|| PaymentError::OrderNotFound(order_id.to_string()))?;
        if amount != due {
            return Err(PaymentError::invalid_amount(
                amount,
                format!("order {} is due {}", order_id, due),
            ));
        }

        let attempt = PaymentAttempt::new(
            order_id,
            provider,
            phone_number,
            amount,
            self.clock.now(),
            self.window(),
        );
        let attempt_id = attempt.attempt_id;

        if !self.attempts.insert_if_no_active(&attempt).await? {
            warn!(order_id = %order_id, "Rejected duplicate payment attempt");
            return Err(PaymentError::DuplicateAttempt {
                order_id: order_id.to_string(),
            });
        }

        info!(
            attempt_id = %attempt_id,
            order_id = %order_id,
            provider = %provider,
            amount = %amount,
            "Payment attempt initiated"
        );

        let request = PushRequest {
            phone_number: phone_number.to_string(),
            amount,
            order_ref: order_id.to_string(),
            attempt_id,
        };

        let pushed = tokio::time::timeout(self.config.push_timeout, gateway.push(&request))
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::transient(
                    provider,
                    format!("push did not complete within {:?}", self.config.push_timeout),
                ))
            });

        match pushed {
            Ok(reference) => self.record_push(attempt_id, &reference).await,
            Err(e) => {
                let message = e.to_string();
                warn!(attempt_id = %attempt_id, error = %message, "Push rejected");

                let transition = Transition::new(
                    AttemptState::Initiated,
                    AttemptState::Failed,
                    self.clock.now(),
                )
                .with_reason(Some(message.clone()));
                if let Err(store_err) = self.attempts.transition(attempt_id, &transition).await {
                    // Left initiated; the sweep times it out at the deadline
                    error!(
                        attempt_id = %attempt_id,
                        error = %store_err,
                        "Failed to record rejected push"
                    );
                }

                Err(PaymentError::GatewayRejected {
                    attempt_id,
                    provider,
                    message,
                })
            }
        }
    }

    /// Move an attempt to `awaiting_confirmation` once the gateway accepted the push
    ///
    /// The customer already has the prompt at this point, so storage errors are
    /// retried once and then only logged with the reference for reconciliation.
    async fn record_push(&self, attempt_id: Uuid, reference: &str) -> PaymentResult<Uuid> {
        let transition = Transition::new(
            AttemptState::Initiated,
            AttemptState::AwaitingConfirmation,
            self.clock.now(),
        )
        .with_reference(reference);

        let mut outcome = self.attempts.transition(attempt_id, &transition).await;
        if let Err(e) = &outcome {
            warn!(
                attempt_id = %attempt_id,
                provider_reference = %reference,
                error = %e,
                "Failed to record accepted push, retrying"
            );
            outcome = self.attempts.transition(attempt_id, &transition).await;
        }

        match outcome {
            Ok(Some(_)) => {
                info!(
                    attempt_id = %attempt_id,
                    provider_reference = %reference,
                    "Push accepted, awaiting confirmation"
                );
                Ok(attempt_id)
            }
            Ok(None) => {
                if let Err(e) = self.attempts.record_reference(attempt_id, reference).await {
                    error!(
                        attempt_id = %attempt_id,
                        provider_reference = %reference,
                        error = %e,
                        "Failed to store provider reference"
                    );
                }

                let current = self.get_attempt(attempt_id).await?;
                if !current.state.is_terminal() {
                    // The first write landed before its error was reported
                    return Ok(attempt_id);
                }

                warn!(
                    attempt_id = %attempt_id,
                    provider_reference = %reference,
                    state = %current.state,
                    "Attempt closed before the push was acknowledged"
                );
                Err(PaymentError::AttemptClosed {
                    attempt_id,
                    state: current.state,
                })
            }
            Err(e) => {
                error!(
                    attempt_id = %attempt_id,
                    provider_reference = %reference,
                    error = %e,
                    "Failed to record accepted push; attempt stays initiated until it times out"
                );
                Ok(attempt_id)
            }
        }
    }

    /// Check an attempt against its gateway and apply the outcome
    ///
    /// Terminal attempts answer from the store without contacting the gateway.
    pub async fn poll_status(&self, attempt_id: Uuid) -> PaymentResult<AttemptState> {
        let attempt = self.get_attempt(attempt_id).await?;

        if attempt.state.is_terminal() {
            debug!(attempt_id = %attempt_id, state = %attempt.state, "Attempt already resolved");
            return Ok(attempt.state);
        }

        let Some(reference) = attempt.provider_reference.as_deref() else {
            return Ok(attempt.state);
        };

        let gateway = self.gateway(attempt.provider)?;
        let status = gateway.check_status(reference).await.map_err(|e| {
            warn!(attempt_id = %attempt_id, error = %e, "Status check failed");
            PaymentError::TransientGatewayError {
                provider: attempt.provider,
                message: e.to_string(),
            }
        })?;

        self.resolve(&attempt, status).await
    }

    async fn resolve(
        &self,
        attempt: &PaymentAttempt,
        status: GatewayStatus,
    ) -> PaymentResult<AttemptState> {
        let attempt_id = attempt.attempt_id;
        let now = self.clock.now();

        let transition = match status {
            GatewayStatus::Pending => {
                self.attempts.touch(attempt_id, now).await?;
                debug!(attempt_id = %attempt_id, "Payment still pending");
                return Ok(attempt.state);
            }
            GatewayStatus::Success { receipt } => {
                Transition::new(attempt.state, AttemptState::Completed, now).with_receipt(receipt)
            }
            GatewayStatus::Failure { reason } => {
                Transition::new(attempt.state, AttemptState::Failed, now).with_reason(reason)
            }
        };

        match self.attempts.transition(attempt_id, &transition).await? {
            Some(updated) => {
                info!(attempt_id = %attempt_id, state = %updated.state, "Payment attempt resolved");
                if updated.needs_settlement() {
                    // The sweep retries settlement if the order store is down.
                    if let Err(e) = self.settle_attempt(&updated).await {
                        error!(
                            attempt_id = %attempt_id,
                            order_id = %updated.order_id,
                            error = %e,
                            "Failed to mark order paid"
                        );
                    }
                }
                Ok(updated.state)
            }
            None => self.current_state(attempt_id).await,
        }
    }

    /// Time out an attempt whose confirmation window has elapsed
    ///
    /// A no-op for terminal attempts and for attempts still inside their window.
    pub async fn expire(&self, attempt_id: Uuid) -> PaymentResult<AttemptState> {
        let attempt = self.get_attempt(attempt_id).await?;
        if attempt.state.is_terminal() {
            return Ok(attempt.state);
        }

        let now = self.clock.now();
        if !attempt.is_expired_at(now) {
            return Ok(attempt.state);
        }

        let transition = Transition::new(attempt.state, AttemptState::TimedOut, now)
            .with_reason(Some("confirmation window elapsed".to_string()));

        match self.attempts.transition(attempt_id, &transition).await? {
            Some(updated) => {
                info!(attempt_id = %attempt_id, order_id = %updated.order_id, "Payment attempt timed out");
                Ok(updated.state)
            }
            None => self.current_state(attempt_id).await,
        }
    }

    /// Feed a provider callback into the status check
    ///
    /// The callback body only identifies the attempt; the outcome is re-read from
    /// the gateway. Returns `None` when no attempt matches the reference.
    pub async fn handle_callback(
        &self,
        provider: Provider,
        provider_reference: &str,
    ) -> PaymentResult<Option<AttemptState>> {
        let attempt = self
            .attempts
            .find_by_provider_reference(provider, provider_reference)
            .await?;

        match attempt {
            Some(attempt) => self.poll_status(attempt.attempt_id).await.map(Some),
            None => {
                warn!(
                    provider = %provider,
                    provider_reference = %provider_reference,
                    "Callback for unknown payment attempt"
                );
                Ok(None)
            }
        }
    }

    /// Retry marking the order paid for a completed, unsettled attempt
    pub async fn settle(&self, attempt_id: Uuid) -> PaymentResult<bool> {
        let attempt = self.get_attempt(attempt_id).await?;
        self.settle_attempt(&attempt).await
    }

    async fn settle_attempt(&self, attempt: &PaymentAttempt) -> PaymentResult<bool> {
        if !attempt.needs_settlement() {
            return Ok(false);
        }

        let attempt_id = attempt.attempt_id;
        let now = self.clock.now();
        let lease = chrono::Duration::seconds(SETTLE_LEASE_SECS);
        if !self.attempts.claim_settlement(attempt_id, now, lease).await? {
            debug!(attempt_id = %attempt_id, "Settlement already claimed");
            return Ok(false);
        }

        if let Err(e) = self.orders.mark_paid(&attempt.order_id).await {
            if let Err(release) = self.attempts.release_settlement(attempt_id).await {
                warn!(attempt_id = %attempt_id, error = %release, "Failed to release settlement claim");
            }
            return Err(e.into());
        }
        self.attempts.mark_settled(attempt_id, now).await?;

        info!(
            attempt_id = %attempt_id,
            order_id = %attempt.order_id,
            "Order marked paid"
        );
        Ok(true)
    }

    pub async fn get_attempt(&self, attempt_id: Uuid) -> PaymentResult<PaymentAttempt> {
        self.attempts
            .find_by_id(attempt_id)
            .await?
            .ok_or(PaymentError::AttemptNotFound(attempt_id))
    }

    async fn current_state(&self, attempt_id: Uuid) -> PaymentResult<AttemptState> {
        let attempt = self.get_attempt(attempt_id).await?;
        debug!(attempt_id = %attempt_id, state = %attempt.state, "Lost state transition race");
        Ok(attempt.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::memory::{InMemoryAttemptStore, InMemoryOrderStore};
    use crate::payments::error::GatewayResult;
    use crate::payments::types::CallbackNotice;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct FixedGateway {
        status: Mutex<GatewayResult<GatewayStatus>>,
    }

    #[async_trait]
    impl PaymentGateway for FixedGateway {
        fn provider(&self) -> Provider {
            Provider::Mpesa
        }

        async fn push(&self, _request: &PushRequest) -> GatewayResult<String> {
            Ok("ws_CO_fixed".to_string())
        }

        async fn check_status(&self, _reference: &str) -> GatewayResult<GatewayStatus> {
            self.status.lock().unwrap().clone()
        }

        fn validate_callback_signature(&self, _payload: &[u8], _signature: Option<&str>) -> bool {
            true
        }

        fn parse_callback(&self, _payload: &[u8]) -> GatewayResult<CallbackNotice> {
            Ok(CallbackNotice {
                provider_reference: "ws_CO_fixed".to_string(),
                reported: GatewayStatus::Pending,
            })
        }
    }

    async fn setup(
        status: GatewayResult<GatewayStatus>,
    ) -> (PaymentConfirmationCoordinator, InMemoryOrderStore) {
        let orders = InMemoryOrderStore::new();
        orders.insert_order("O1", dec!(1500)).await;
        let coordinator = PaymentConfirmationCoordinator::new(
            Arc::new(InMemoryAttemptStore::new()),
            Arc::new(orders.clone()),
            CoordinatorConfig::default(),
        )
        .with_gateway(Arc::new(FixedGateway {
            status: Mutex::new(status),
        }));
        (coordinator, orders)
    }

    #[tokio::test]
    async fn test_unknown_provider_is_unavailable() {
        let (coordinator, _) = setup(Ok(GatewayStatus::Pending)).await;
        let result = coordinator
            .initiate("O1", Provider::AirtelMoney, "0733123456", dec!(1500))
            .await;
        assert!(matches!(
            result,
            Err(PaymentError::ProviderUnavailable(Provider::AirtelMoney))
        ));
    }

    #[tokio::test]
    async fn test_amount_must_match_due() {
        let (coordinator, _) = setup(Ok(GatewayStatus::Pending)).await;
        let result = coordinator
            .initiate("O1", Provider::Mpesa, "0712345678", dec!(1499))
            .await;
        assert!(matches!(result, Err(PaymentError::InvalidAmount { .. })));
    }

    #[tokio::test]
    async fn test_unknown_order() {
        let (coordinator, _) = setup(Ok(GatewayStatus::Pending)).await;
        let result = coordinator
            .initiate("missing", Provider::Mpesa, "0712345678", dec!(1500))
            .await;
        assert!(matches!(result, Err(PaymentError::OrderNotFound(id)) if id == "missing"));
    }

    #[tokio::test]
    async fn test_transient_status_error_leaves_state() {
        let (coordinator, orders) = setup(Err(GatewayError::transient(
            Provider::Mpesa,
            "connection reset",
        )))
        .await;
        let attempt_id = coordinator
            .initiate("O1", Provider::Mpesa, "0712345678", dec!(1500))
            .await
            .unwrap();

        let result = coordinator.poll_status(attempt_id).await;
        assert!(matches!(
            result,
            Err(PaymentError::TransientGatewayError { .. })
        ));

        let attempt = coordinator.get_attempt(attempt_id).await.unwrap();
        assert_eq!(attempt.state, AttemptState::AwaitingConfirmation);
        assert_eq!(orders.mark_paid_count("O1").await, 0);
    }

    #[tokio::test]
    async fn test_failure_records_reason() {
        let (coordinator, orders) = setup(Ok(GatewayStatus::Failure {
            reason: Some("Request cancelled by user".to_string()),
        }))
        .await;
        let attempt_id = coordinator
            .initiate("O1", Provider::Mpesa, "0712345678", dec!(1500))
            .await
            .unwrap();

        let state = coordinator.poll_status(attempt_id).await.unwrap();
        assert_eq!(state, AttemptState::Failed);

        let attempt = coordinator.get_attempt(attempt_id).await.unwrap();
        assert_eq!(
            attempt.failure_reason.as_deref(),
            Some("Request cancelled by user")
        );
        assert!(attempt.resolved_at.is_some());
        assert!(!orders.is_paid("O1").await);
    }
}
