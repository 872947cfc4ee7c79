//! M-Pesa (Safaricom Daraja) STK push gateway
//!
//! Sends Lipa na M-Pesa Online prompts and queries their status. Phone numbers
//! are normalised to the `2547XXXXXXXX` / `2541XXXXXXXX` form Daraja expects and
//! amounts must be whole shillings.

use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::providers::client::{flexible_code, flexible_u64, GatewayHttpClient, TokenCache};
use crate::payments::providers::phone::national_number;
use crate::payments::traits::PaymentGateway;
use crate::payments::types::{CallbackNotice, GatewayStatus, Provider, PushRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

const KENYA_DIAL_CODE: &str = "254";

/// Daraja's "transaction is being processed" error on STK query
const STILL_PROCESSING_ERROR: &str = "500.001.1001";

/// Daraja caps `AccountReference` at 12 characters
const ACCOUNT_REFERENCE_MAX: usize = 12;

/// M-Pesa gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MpesaConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Paybill or till number
    pub shortcode: String,
    pub passkey: String,
    /// Public URL Daraja posts STK results to
    pub callback_url: String,
    /// Daraja base URL (defaults to the sandbox)
    pub base_url: String,
    /// `CustomerPayBillOnline` or `CustomerBuyGoodsOnline`
    pub transaction_type: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            consumer_key: String::new(),
            consumer_secret: String::new(),
            shortcode: String::new(),
            passkey: String::new(),
            callback_url: String::new(),
            base_url: "https://sandbox.safaricom.co.ke".to_string(),
            transaction_type: "CustomerPayBillOnline".to_string(),
            timeout_secs: 30,
            max_retries: 3,
            retry_backoff_ms: 1000,
        }
    }
}

impl MpesaConfig {
    /// Load from environment variables; `None` when M-Pesa is not configured
    pub fn from_env() -> Result<Option<Self>> {
        let Ok(consumer_key) = std::env::var("MPESA_CONSUMER_KEY") else {
            return Ok(None);
        };
        let defaults = Self::default();

        let config = Self {
            consumer_key,
            consumer_secret: std::env::var("MPESA_CONSUMER_SECRET")
                .context("MPESA_CONSUMER_SECRET not set")?,
            shortcode: std::env::var("MPESA_SHORTCODE").context("MPESA_SHORTCODE not set")?,
            passkey: std::env::var("MPESA_PASSKEY").context("MPESA_PASSKEY not set")?,
            callback_url: std::env::var("MPESA_CALLBACK_URL")
                .context("MPESA_CALLBACK_URL not set")?,
            base_url: std::env::var("MPESA_BASE_URL").unwrap_or(defaults.base_url),
            transaction_type: std::env::var("MPESA_TRANSACTION_TYPE")
                .unwrap_or(defaults.transaction_type),
            timeout_secs: std::env::var("MPESA_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("MPESA_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_backoff_ms: defaults.retry_backoff_ms,
        };

        Ok(Some(config))
    }
}

pub struct MpesaGateway {
    config: MpesaConfig,
    http: GatewayHttpClient,
    token: TokenCache,
}

impl MpesaGateway {
    pub fn new(config: MpesaConfig) -> GatewayResult<Self> {
        let http = GatewayHttpClient::new(
            Provider::Mpesa,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
            Duration::from_millis(config.retry_backoff_ms),
        )?;

        info!(
            "M-Pesa gateway initialized: shortcode={}, base_url={}",
            config.shortcode, config.base_url
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
                let url = format!(
                    "{}/oauth/v1/generate?grant_type=client_credentials",
                    self.config.base_url
                );
                let request = self.http.http().get(&url).basic_auth(
                    &self.config.consumer_key,
                    Some(&self.config.consumer_secret),
                );

                let (status, body) = self.http.send(request).await?;
                if !status.is_success() {
                    error!("M-Pesa token request failed: HTTP {}", status);
                    return Err(GatewayError::transient(
                        Provider::Mpesa,
                        format!("token request failed: HTTP {}", status),
                    ));
                }

                let token: TokenResponse = serde_json::from_str(&body).map_err(|e| {
                    GatewayError::transient(Provider::Mpesa, format!("Invalid token response: {}", e))
                })?;
                let expires_in = flexible_u64(&token.expires_in).unwrap_or(3599);
                Ok((token.access_token, expires_in))
            })
            .await
    }

    /// `base64(shortcode + passkey + timestamp)`
    fn password(&self, timestamp: &str) -> String {
        BASE64.encode(format!(
            "{}{}{}",
            self.config.shortcode, self.config.passkey, timestamp
        ))
    }

    async fn post(&self, endpoint: &str, payload: &serde_json::Value) -> GatewayResult<(reqwest::StatusCode, String)> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.config.base_url, endpoint);
        let request = self
            .http
            .http()
            .post(&url)
            .bearer_auth(token)
            .json(payload);
        self.http.send(request).await
    }
}

/// Daraja timestamps are Nairobi local time (UTC+3, no DST)
pub fn daraja_timestamp(now: DateTime<Utc>) -> String {
    (now + chrono::Duration::hours(3))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

/// Normalise to `2547XXXXXXXX` / `2541XXXXXXXX`
pub fn msisdn(phone: &str) -> Option<String> {
    national_number(phone, KENYA_DIAL_CODE)
        .filter(|n| n.starts_with('7') || n.starts_with('1'))
        .map(|n| format!("{}{}", KENYA_DIAL_CODE, n))
}

/// Daraja only takes whole shillings
pub fn whole_shillings(amount: Decimal) -> Option<u64> {
    if amount.fract().is_zero() {
        amount.to_u64().filter(|a| *a > 0)
    } else {
        None
    }
}

/// Map an STK query `ResultCode` to a gateway status
pub fn status_from_result_code(code: &str, description: Option<String>) -> GatewayStatus {
    match code {
        "0" => GatewayStatus::Success { receipt: None },
        // 4999: transaction still under processing
        "4999" => GatewayStatus::Pending,
        // 1032 cancelled, 1037 unreachable, 2001 wrong PIN, 1 insufficient funds
        _ => GatewayStatus::Failure {
            reason: description.or_else(|| Some(format!("M-Pesa result code {}", code))),
        },
    }
}

#[async_trait]
impl PaymentGateway for MpesaGateway {
    fn provider(&self) -> Provider {
        Provider::Mpesa
    }

    async fn push(&self, request: &PushRequest) -> GatewayResult<String> {
        let phone = msisdn(&request.phone_number).ok_or_else(|| {
            GatewayError::rejected(
                Provider::Mpesa,
                format!("invalid Safaricom number '{}'", request.phone_number),
            )
        })?;
        let amount = whole_shillings(request.amount).ok_or_else(|| {
            GatewayError::rejected(
                Provider::Mpesa,
                format!("amount {} is not a whole number of shillings", request.amount),
            )
        })?;

        let timestamp = daraja_timestamp(Utc::now());
        let account_reference: String =
            request.order_ref.chars().take(ACCOUNT_REFERENCE_MAX).collect();

        info!(
            "Initiating M-Pesa STK push: amount={}, account_reference={}",
            amount, account_reference
        );

        let payload = serde_json::json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "TransactionType": self.config.transaction_type,
            "Amount": amount,
            "PartyA": phone,
            "PartyB": self.config.shortcode,
            "PhoneNumber": phone,
            "CallBackURL": self.config.callback_url,
            "AccountReference": account_reference,
            "TransactionDesc": format!("Order {}", request.order_ref),
        });

        let (status, body) = self.post("/mpesa/stkpush/v1/processrequest", &payload).await?;

        if status.is_server_error() {
            return Err(GatewayError::transient(
                Provider::Mpesa,
                format!("HTTP {}: {}", status, body),
            ));
        }
        if !status.is_success() {
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error_message)
                .unwrap_or_else(|_| format!("HTTP {}: {}", status, body));
            error!("M-Pesa STK push rejected: {}", message);
            return Err(GatewayError::rejected(Provider::Mpesa, message));
        }

        let response: StkPushResponse = serde_json::from_str(&body).map_err(|e| {
            GatewayError::rejected(Provider::Mpesa, format!("Invalid response format: {}", e))
        })?;

        if response.response_code != "0" {
            return Err(GatewayError::rejected(
                Provider::Mpesa,
                response.response_description,
            ));
        }

        info!(
            "M-Pesa STK push accepted: checkout_request_id={}",
            response.checkout_request_id
        );
        Ok(response.checkout_request_id)
    }

    async fn check_status(&self, provider_reference: &str) -> GatewayResult<GatewayStatus> {
        let timestamp = daraja_timestamp(Utc::now());
        let payload = serde_json::json!({
            "BusinessShortCode": self.config.shortcode,
            "Password": self.password(&timestamp),
            "Timestamp": timestamp,
            "CheckoutRequestID": provider_reference,
        });

        let (status, body) = self.post("/mpesa/stkpushquery/v1/query", &payload).await?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<ErrorResponse>(&body) {
                if err.error_code == STILL_PROCESSING_ERROR {
                    return Ok(GatewayStatus::Pending);
                }
                return Err(GatewayError::transient(
                    Provider::Mpesa,
                    format!("{}: {}", err.error_code, err.error_message),
                ));
            }
            return Err(GatewayError::transient(
                Provider::Mpesa,
                format!("HTTP {}: {}", status, body),
            ));
        }

        let response: StkQueryResponse = serde_json::from_str(&body).map_err(|e| {
            GatewayError::transient(Provider::Mpesa, format!("Invalid response format: {}", e))
        })?;

        let code = response
            .result_code
            .as_ref()
            .and_then(flexible_code)
            .ok_or_else(|| GatewayError::transient(Provider::Mpesa, "STK query without ResultCode"))?;

        info!(
            "M-Pesa STK query: checkout_request_id={}, result_code={}",
            provider_reference, code
        );
        Ok(status_from_result_code(&code, response.result_desc))
    }

    /// Daraja does not sign STK callbacks; outcomes are re-queried instead
    fn validate_callback_signature(&self, _payload: &[u8], _signature: Option<&str>) -> bool {
        true
    }

    fn parse_callback(&self, payload: &[u8]) -> GatewayResult<CallbackNotice> {
        let callback: StkCallbackEnvelope = serde_json::from_slice(payload).map_err(|e| {
            GatewayError::rejected(Provider::Mpesa, format!("Invalid STK callback: {}", e))
        })?;
        let stk = callback.body.stk_callback;

        let code = flexible_code(&stk.result_code).unwrap_or_default();
        let reported = match status_from_result_code(&code, stk.result_desc) {
            GatewayStatus::Success { .. } => GatewayStatus::Success {
                receipt: stk.callback_metadata.and_then(|m| m.receipt()),
            },
            other => other,
        };

        Ok(CallbackNotice {
            provider_reference: stk.checkout_request_id,
            reported,
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
#[serde(rename_all = "camelCase")]
struct ErrorResponse {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    error_message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkPushResponse {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    response_code: String,
    #[serde(default)]
    response_description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkQueryResponse {
    #[serde(default)]
    result_code: Option<serde_json::Value>,
    #[serde(default)]
    result_desc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StkCallbackEnvelope {
    #[serde(rename = "Body")]
    body: StkCallbackBody,
}

#[derive(Debug, Deserialize)]
struct StkCallbackBody {
    #[serde(rename = "stkCallback")]
    stk_callback: StkCallback,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct StkCallback {
    #[serde(rename = "CheckoutRequestID")]
    checkout_request_id: String,
    result_code: serde_json::Value,
    #[serde(default)]
    result_desc: Option<String>,
    #[serde(default)]
    callback_metadata: Option<CallbackMetadata>,
}

#[derive(Debug, Deserialize)]
struct CallbackMetadata {
    #[serde(rename = "Item", default)]
    items: Vec<CallbackItem>,
}

impl CallbackMetadata {
    fn receipt(&self) -> Option<String> {
        self.items
            .iter()
            .find(|item| item.name == "MpesaReceiptNumber")
            .and_then(|item| item.value.as_ref())
            .and_then(|v| v.as_str().map(str::to_string))
    }
}

#[derive(Debug, Deserialize)]
struct CallbackItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value", default)]
    value: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn create_test_gateway() -> MpesaGateway {
        let config = MpesaConfig {
            consumer_key: "key".to_string(),
            consumer_secret: "secret".to_string(),
            shortcode: "174379".to_string(),
            passkey: "passkey".to_string(),
            callback_url: "https://shop.example/api/payments/callbacks/mpesa".to_string(),
            ..Default::default()
        };
        MpesaGateway::new(config).unwrap()
    }

    #[test]
    fn test_mpesa_config_default() {
        let config = MpesaConfig::default();
        assert_eq!(config.base_url, "https://sandbox.safaricom.co.ke");
        assert_eq!(config.transaction_type, "CustomerPayBillOnline");
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_daraja_timestamp_is_nairobi_time() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 22, 30, 5).unwrap();
        assert_eq!(daraja_timestamp(now), "20240302013005");
    }

    #[test]
    fn test_password_encoding() {
        let gateway = create_test_gateway();
        let password = gateway.password("20240302013005");
        let decoded = BASE64.decode(password).unwrap();
        assert_eq!(decoded, b"174379passkey20240302013005");
    }

    #[test]
    fn test_msisdn_normalisation() {
        assert_eq!(msisdn("+254712345678").as_deref(), Some("254712345678"));
        assert_eq!(msisdn("0110 123 456").as_deref(), Some("254110123456"));
        assert_eq!(msisdn("0812345678"), None);
        assert_eq!(msisdn("12345"), None);
    }

    #[test]
    fn test_whole_shillings() {
        assert_eq!(whole_shillings(dec!(1500)), Some(1500));
        assert_eq!(whole_shillings(dec!(1500.00)), Some(1500));
        assert_eq!(whole_shillings(dec!(1500.50)), None);
        assert_eq!(whole_shillings(dec!(0)), None);
    }

    #[test]
    fn test_status_from_result_code() {
        assert_eq!(
            status_from_result_code("0", None),
            GatewayStatus::Success { receipt: None }
        );
        assert_eq!(status_from_result_code("4999", None), GatewayStatus::Pending);
        assert_eq!(
            status_from_result_code("1032", Some("Request cancelled by user".to_string())),
            GatewayStatus::Failure {
                reason: Some("Request cancelled by user".to_string())
            }
        );
    }

    #[test]
    fn test_parse_success_callback() {
        let gateway = create_test_gateway();
        let payload = br#"{
            "Body": {
                "stkCallback": {
                    "MerchantRequestID": "29115-34620561-1",
                    "CheckoutRequestID": "ws_CO_191220191020363925",
                    "ResultCode": 0,
                    "ResultDesc": "The service request is processed successfully.",
                    "CallbackMetadata": {
                        "Item": [
                            {"Name": "Amount", "Value": 1500.00},
                            {"Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV"},
                            {"Name": "Balance"},
                            {"Name": "PhoneNumber", "Value": 254712345678}
                        ]
                    }
                }
            }
        }"#;

        let notice = gateway.parse_callback(payload).unwrap();
        assert_eq!(notice.provider_reference, "ws_CO_191220191020363925");
        assert_eq!(
            notice.reported,
            GatewayStatus::Success {
                receipt: Some("NLJ7RT61SV".to_string())
            }
        );
    }

    #[test]
    fn test_parse_cancelled_callback() {
        let gateway = create_test_gateway();
        let payload = br#"{"Body":{"stkCallback":{"MerchantRequestID":"1","CheckoutRequestID":"ws_CO_1","ResultCode":1032,"ResultDesc":"Request cancelled by user"}}}"#;
        let notice = gateway.parse_callback(payload).unwrap();
        assert!(matches!(notice.reported, GatewayStatus::Failure { .. }));
    }

    #[test]
    fn test_parse_callback_rejects_garbage() {
        let gateway = create_test_gateway();
        assert!(gateway.parse_callback(b"not json").is_err());
    }

    #[tokio::test]
    async fn test_push_rejects_invalid_phone_without_network() {
        let gateway = create_test_gateway();
        let request = PushRequest {
            phone_number: "12".to_string(),
            amount: dec!(100),
            order_ref: "O1".to_string(),
            attempt_id: uuid::Uuid::new_v4(),
        };
        let err = gateway.push(&request).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { .. }));
    }
}
