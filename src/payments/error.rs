use crate::database::error::DatabaseError;
use crate::payments::types::{AttemptState, Provider};
use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

pub type PaymentResult<T> = Result<T, PaymentError>;
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors raised by a gateway client
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// The gateway refused the request; retrying with the same input will not help
    #[error("{provider} rejected the request: {message}")]
    Rejected { provider: Provider, message: String },

    /// Network failure, timeout, rate limit or 5xx after retries
    #[error("{provider} is unavailable: {message}")]
    Transient { provider: Provider, message: String },
}

impl GatewayError {
    pub fn rejected(provider: Provider, message: impl Into<String>) -> Self {
        Self::Rejected {
            provider,
            message: message.into(),
        }
    }

    pub fn transient(provider: Provider, message: impl Into<String>) -> Self {
        Self::Transient {
            provider,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient { .. })
    }
}

/// Errors returned by the payment confirmation coordinator
#[derive(Debug, Error)]
pub enum PaymentError {
    /// Another attempt for the order is still in flight
    #[error("order {order_id} already has a payment in progress")]
    DuplicateAttempt { order_id: String },

    /// The push was refused synchronously; the attempt is now failed
    #[error("payment push rejected: {message}")]
    GatewayRejected {
        attempt_id: Uuid,
        provider: Provider,
        message: String,
    },

    /// The push went out but the attempt had already been closed, usually by the
    /// timeout sweep while the gateway was slow to answer
    #[error("payment attempt {attempt_id} closed as {state} before the push was acknowledged")]
    AttemptClosed {
        attempt_id: Uuid,
        state: AttemptState,
    },

    /// The gateway could not be reached while checking status; state unchanged
    #[error("payment gateway unavailable, retry the status check: {message}")]
    TransientGatewayError { provider: Provider, message: String },

    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount { amount: Decimal, reason: String },

    #[error("payment attempt {0} not found")]
    AttemptNotFound(Uuid),

    #[error("order {0} not found")]
    OrderNotFound(String),

    #[error("provider {0} is not configured")]
    ProviderUnavailable(Provider),

    #[error(transparent)]
    Storage(#[from] DatabaseError),
}

impl PaymentError {
    pub fn invalid_amount(amount: Decimal, reason: impl Into<String>) -> Self {
        Self::InvalidAmount {
            amount,
            reason: reason.into(),
        }
    }
}
