//! Application error type returned by the HTTP layer

use crate::payments::error::PaymentError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;

/// Business rule violations caused by the request itself
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DomainError {
    #[error("{message}")]
    InvalidAmount { message: String },

    #[error("order {order_id} already has a payment in progress")]
    DuplicateAttempt { order_id: String },

    #[error("payment attempt {attempt_id} is already {state}")]
    AttemptClosed { attempt_id: String, state: String },

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{message}")]
    Validation { message: String },

    #[error("callback signature verification failed")]
    InvalidSignature,
}

/// Failures reported by a mobile-money provider
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExternalError {
    #[error("{provider}: {message}")]
    PaymentProvider {
        provider: String,
        message: String,
        retryable: bool,
    },

    #[error("provider {provider} is not configured")]
    ProviderUnavailable { provider: String },
}

/// Failures of our own storage
#[derive(Debug, Clone, Error, PartialEq)]
pub enum InfrastructureError {
    #[error("storage error: {message}")]
    Database { message: String, retryable: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppErrorKind {
    Domain(DomainError),
    External(ExternalError),
    Infrastructure(InfrastructureError),
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct AppError {
    pub kind: AppErrorKind,
    message: String,
}

impl AppError {
    pub fn new(kind: AppErrorKind) -> Self {
        let message = match &kind {
            AppErrorKind::Domain(e) => e.to_string(),
            AppErrorKind::External(e) => e.to_string(),
            AppErrorKind::Infrastructure(e) => e.to_string(),
        };
        Self { kind, message }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(AppErrorKind::Domain(DomainError::Validation {
            message: message.into(),
        }))
    }

    pub fn status_code(&self) -> StatusCode {
        match &self.kind {
            AppErrorKind::Domain(DomainError::InvalidAmount { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            AppErrorKind::Domain(DomainError::DuplicateAttempt { .. })
            | AppErrorKind::Domain(DomainError::AttemptClosed { .. }) => StatusCode::CONFLICT,
            AppErrorKind::Domain(DomainError::NotFound { .. }) => StatusCode::NOT_FOUND,
            AppErrorKind::Domain(DomainError::Validation { .. }) => StatusCode::BAD_REQUEST,
            AppErrorKind::Domain(DomainError::InvalidSignature) => StatusCode::UNAUTHORIZED,
            AppErrorKind::External(ExternalError::PaymentProvider { retryable, .. }) => {
                if *retryable {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::PAYMENT_REQUIRED
                }
            }
            AppErrorKind::External(ExternalError::ProviderUnavailable { .. }) => {
                StatusCode::BAD_REQUEST
            }
            AppErrorKind::Infrastructure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for API clients
    pub fn code(&self) -> &'static str {
        match &self.kind {
            AppErrorKind::Domain(DomainError::InvalidAmount { .. }) => "INVALID_AMOUNT",
            AppErrorKind::Domain(DomainError::DuplicateAttempt { .. }) => "DUPLICATE_ATTEMPT",
            AppErrorKind::Domain(DomainError::AttemptClosed { .. }) => "ATTEMPT_CLOSED",
            AppErrorKind::Domain(DomainError::NotFound { .. }) => "NOT_FOUND",
            AppErrorKind::Domain(DomainError::Validation { .. }) => "VALIDATION_ERROR",
            AppErrorKind::Domain(DomainError::InvalidSignature) => "INVALID_SIGNATURE",
            AppErrorKind::External(ExternalError::PaymentProvider { retryable: true, .. }) => {
                "GATEWAY_UNAVAILABLE"
            }
            AppErrorKind::External(ExternalError::PaymentProvider { .. }) => "GATEWAY_REJECTED",
            AppErrorKind::External(ExternalError::ProviderUnavailable { .. }) => {
                "PROVIDER_UNAVAILABLE"
            }
            AppErrorKind::Infrastructure(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<PaymentError> for AppError {
    fn from(error: PaymentError) -> Self {
        let kind = match error {
            PaymentError::InvalidAmount { amount, reason } => {
                AppErrorKind::Domain(DomainError::InvalidAmount {
                    message: format!("invalid amount {}: {}", amount, reason),
                })
            }
            PaymentError::DuplicateAttempt { order_id } => {
                AppErrorKind::Domain(DomainError::DuplicateAttempt { order_id })
            }
            PaymentError::AttemptClosed { attempt_id, state } => {
                AppErrorKind::Domain(DomainError::AttemptClosed {
                    attempt_id: attempt_id.to_string(),
                    state: state.to_string(),
                })
            }
            PaymentError::AttemptNotFound(id) => AppErrorKind::Domain(DomainError::NotFound {
                entity: "payment attempt",
                id: id.to_string(),
            }),
            PaymentError::OrderNotFound(id) => AppErrorKind::Domain(DomainError::NotFound {
                entity: "order",
                id,
            }),
            PaymentError::GatewayRejected {
                provider, message, ..
            } => AppErrorKind::External(ExternalError::PaymentProvider {
                provider: provider.to_string(),
                message,
                retryable: false,
            }),
            PaymentError::TransientGatewayError { provider, message } => {
                AppErrorKind::External(ExternalError::PaymentProvider {
                    provider: provider.to_string(),
                    message,
                    retryable: true,
                })
            }
            PaymentError::ProviderUnavailable(provider) => {
                AppErrorKind::External(ExternalError::ProviderUnavailable {
                    provider: provider.to_string(),
                })
            }
            PaymentError::Storage(e) => AppErrorKind::Infrastructure(InfrastructureError::Database {
                retryable: e.is_retryable(),
                message: e.to_string(),
            }),
        };
        AppError::new(kind)
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: &'a str,
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.code(), error = %self.message, "Request failed");
        }

        // Storage details stay in the logs
        let message = match &self.kind {
            AppErrorKind::Infrastructure(_) => "internal server error",
            _ => self.message.as_str(),
        };
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.code(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
