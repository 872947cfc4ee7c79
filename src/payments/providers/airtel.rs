//! Airtel Money collections gateway
//!
//! Pushes USSD payment prompts through Airtel's Open API and enquires their
//! status. The transaction id sent with the push is the attempt id, which is
//! also what Airtel's enquiry endpoint is keyed by.

use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::providers::client::{flexible_u64, GatewayHttpClient, TokenCache};
use crate::payments::providers::phone::national_number;
use crate::payments::traits::PaymentGateway;
use crate::payments::types::{CallbackNotice, GatewayStatus, Provider, PushRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::time::Duration;
use tracing::{error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Airtel Money gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AirtelConfig {
    pub client_id: String,
    pub client_secret: String,
    /// Airtel Open API base URL (defaults to UAT)
    pub base_url: String,
    /// ISO country code sent in `X-Country`
    pub country: String,
    /// ISO currency code sent in `X-Currency`
    pub currency: String,
    /// International dialing code stripped from subscriber numbers
    pub dial_code: String,
    /// Shared secret for callback signatures; unsigned callbacks are accepted when unset
    pub callback_secret: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for AirtelConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            base_url: "https://openapiuat.airtel.africa".to_string(),
            country: "KE".to_string(),
            currency: "KES".to_string(),
            dial_code: "254".to_string(),
            callback_secret: None,
            timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 1000,
        }
    }
}

impl AirtelConfig {
    /// Load from environment variables; `None` when Airtel Money is not configured
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(client_id) = std::env::var("AIRTEL_CLIENT_ID") else {
            return Ok(None);
        };
        let defaults = Self::default();

        let config = Self {
            client_id,
            client_secret: std::env::var("AIRTEL_CLIENT_SECRET")
                .context("AIRTEL_CLIENT_SECRET not set")?,
            base_url: std::env::var("AIRTEL_BASE_URL").unwrap_or(defaults.base_url),
            country: std::env::var("AIRTEL_COUNTRY").unwrap_or(defaults.country),
            currency: std::env::var("AIRTEL_CURRENCY").unwrap_or(defaults.currency),
            dial_code: std::env::var("AIRTEL_DIAL_CODE").unwrap_or(defaults.dial_code),
            callback_secret: std::env::var("AIRTEL_CALLBACK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            timeout_secs: std::env::var("AIRTEL_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("AIRTEL_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_backoff_ms: defaults.retry_backoff_ms,
        };

        Ok(Some(config))
    }
}

pub struct AirtelGateway {
    config: AirtelConfig,
    http: GatewayHttpClient,
    token: TokenCache,
}

impl AirtelGateway {
    pub fn new(config: AirtelConfig) -> GatewayResult<Self> {
        let http = GatewayHttpClient::new(
            Provider::AirtelMoney,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
            Duration::from_millis(config.retry_backoff_ms),
        )?;

        info!(
            "Airtel Money gateway initialized: country={}, base_url={}",
            config.country, config.base_url
        );

        Ok(Self {
            config,
            http,
            token: TokenCache::new(),
        })
    }

    async fn access_token(&self) -> GatewayResult<String> {
        self.token
            .get_or_refresh(|| async {
                let url = format!("{}/auth/oauth2/token", self.config.base_url);
                let payload = serde_json::json!({
                    "client_id": self.config.client_id,
                    "client_secret": self.config.client_secret,
                    "grant_type": "client_credentials",
                });
                let request = self.http.http().post(&url).json(&payload);

                let (status, body) = self.http.send(request).await?;
                if !status.is_success() {
                    error!("Airtel token request failed: HTTP {}", status);
                    return Err(GatewayError::transient(
                        Provider::AirtelMoney,
                        format!("token request failed: HTTP {}", status),
                    ));
                }

                let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
                    GatewayError::transient(
                        Provider::AirtelMoney,
                        format!("Invalid token response: {}", e),
                    )
                })?;
                let expires_in = flexible_u64(&token.expires_in).unwrap_or(180);
                Ok((token.access_token, expires_in))
            })
            .await
    }

    fn authorized(&self, request: reqwest::RequestBuilder, token: String) -> reqwest::RequestBuilder {
        request
            .bearer_auth(token)
            .header("X-Country", &self.config.country)
            .header("X-Currency", &self.config.currency)
    }
}

/// Map an Airtel transaction status code to a gateway status
pub fn status_from_code(code: &str, message: Option<String>, airtel_money_id: Option<String>) -> GatewayStatus {
    match code {
        "TS" => GatewayStatus::Success {
            receipt: airtel_money_id,
        },
        // TIP: in progress, TA: ambiguous, settle on a later enquiry
        "TIP" | "TA" => GatewayStatus::Pending,
        // TF: failed, TE: expired
        _ => GatewayStatus::Failure {
            reason: message.or_else(|| Some(format!("Airtel status {}", code))),
        },
    }
}

#[async_trait]
impl PaymentGateway for AirtelGateway {
    fn provider(&self) -> Provider {
        Provider::AirtelMoney
    }

    async fn push(&self, request: &PushRequest) -> GatewayResult<String> {
        let msisdn = national_number(&request.phone_number, &self.config.dial_code)
            .ok_or_else(|| {
                GatewayError::rejected(
                    Provider::AirtelMoney,
                    format!("invalid Airtel number '{}'", request.phone_number),
                )
            })?;

        let transaction_id = request.attempt_id.simple().to_string();
        info!(
            "Initiating Airtel Money push: amount={}, transaction_id={}",
            request.amount, transaction_id
        );

        let payload = serde_json::json!({
            "reference": request.order_ref,
            "subscriber": {
                "country": self.config.country,
                "currency": self.config.currency,
                "msisdn": msisdn,
            },
            "transaction": {
                "amount": request.amount,
                "country": self.config.country,
                "currency": self.config.currency,
                "id": transaction_id,
            },
        });

        let token = self.access_token().await?;
        let url = format!("{}/merchant/v1/payments/", self.config.base_url);
        let http_request = self.authorized(self.http.http().post(&url), token).json(&payload);
        let (status, body) = self.http.send(http_request).await?;

        if status.is_server_error() {
            return Err(GatewayError::transient(
                Provider::AirtelMoney,
                format!("HTTP {}: {}", status, body),
            ));
        }

        let envelope: Envelope<PushData> = serde_json::from_str(&body).map_err(|e| {
            GatewayError::rejected(
                Provider::AirtelMoney,
                format!("HTTP {}: invalid response format: {}", status, e),
            )
        })?;

        if !status.is_success() || !envelope.status.success {
            error!("Airtel Money push rejected: {}", envelope.status.message);
            return Err(GatewayError::rejected(
                Provider::AirtelMoney,
                envelope.status.message,
            ));
        }

        let reference = envelope
            .data
            .and_then(|d| d.transaction.id)
            .unwrap_or(transaction_id);
        info!("Airtel Money push accepted: transaction_id={}", reference);
        Ok(reference)
    }

    async fn check_status(&self, provider_reference: &str) -> GatewayResult<GatewayStatus> {
        let token = self.access_token().await?;
        let url = format!(
            "{}/standard/v1/payments/{}",
            self.config.base_url, provider_reference
        );
        let request = self.authorized(self.http.http().get(&url), token);
        let (status, body) = self.http.send(request).await?;

        if !status.is_success() {
            return Err(GatewayError::transient(
                Provider::AirtelMoney,
                format!("HTTP {}: {}", status, body),
            ));
        }

        let envelope: Envelope<EnquiryData> = serde_json::from_str(&body).map_err(|e| {
            GatewayError::transient(
                Provider::AirtelMoney,
                format!("Invalid response format: {}", e),
            )
        })?;

        let transaction = envelope
            .data
            .map(|d| d.transaction)
            .ok_or_else(|| GatewayError::transient(Provider::AirtelMoney, envelope.status.message))?;

        info!(
            "Airtel Money enquiry: transaction_id={}, status={}",
            provider_reference, transaction.status
        );
        Ok(status_from_code(
            &transaction.status,
            transaction.message,
            transaction.airtel_money_id,
        ))
    }

    fn validate_callback_signature(&self, payload: &[u8], signature: Option<&str>) -> bool {
        let Some(secret) = self.config.callback_secret.as_deref() else {
            return true;
        };
        let Some(signature) = signature else {
            warn!("Airtel callback without signature rejected");
            return false;
        };
        let Ok(expected) = hex::decode(signature.trim()) else {
            return false;
        };

        let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
            return false;
        };
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    }

    fn parse_callback(&self, payload: &[u8]) -> GatewayResult<CallbackNotice> {
        let callback: CallbackEnvelope = serde_json::from_slice(payload).map_err(|e| {
            GatewayError::rejected(Provider::AirtelMoney, format!("Invalid callback: {}", e))
        })?;
        let transaction = callback.transaction;

        Ok(CallbackNotice {
            reported: status_from_code(
                &transaction.status_code,
                transaction.message,
                transaction.airtel_money_id,
            ),
            provider_reference: transaction.id,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    #[serde(default = "Option::default")]
    data: Option<T>,
    status: ResponseStatus,
}

#[derive(Debug, Deserialize)]
struct ResponseStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    success: bool,
}

#[derive(Debug, Deserialize)]
struct PushData {
    transaction: PushTransaction,
}

#[derive(Debug, Deserialize)]
struct PushTransaction {
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EnquiryData {
    transaction: EnquiryTransaction,
}

#[derive(Debug, Deserialize)]
struct EnquiryTransaction {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    airtel_money_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackEnvelope {
    transaction: CallbackTransaction,
}

#[derive(Debug, Deserialize)]
struct CallbackTransaction {
    id: String,
    status_code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    airtel_money_id: Option<String>,
}
