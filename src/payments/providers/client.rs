//! HTTP plumbing shared by the gateway clients
//!
//! Retries rate limits, gateway-side outages and transport errors with
//! exponential backoff, and caches OAuth access tokens until shortly before
//! they expire.

use crate::payments::error::{GatewayError, GatewayResult};
use crate::payments::types::Provider;
use reqwest::{Client, RequestBuilder, StatusCode};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Tokens are refreshed this long before the provider says they expire
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

pub struct GatewayHttpClient {
    provider: Provider,
    client: Client,
    max_retries: u32,
    retry_backoff: Duration,
}

impl GatewayHttpClient {
    pub fn new(
        provider: Provider,
        timeout: Duration,
        max_retries: u32,
        retry_backoff: Duration,
    ) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent("Kahawa-Payments/1.0")
            .build()
            .map_err(|e| {
                GatewayError::transient(provider, format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            provider,
            client,
            max_retries,
            retry_backoff,
        })
    }

    pub fn http(&self) -> &Client {
        &self.client
    }

    /// Send a request and return the final status code and body
    ///
    /// 429, 502, 503 and 504 responses and transport errors are retried. Any
    /// other response is returned as-is for the provider to interpret.
    pub async fn send(&self, request: RequestBuilder) -> GatewayResult<(StatusCode, String)> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            let req = request.try_clone().ok_or_else(|| {
                GatewayError::rejected(self.provider, "Failed to clone request")
            })?;

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();

                    if is_retryable_status(status) && attempt < self.max_retries {
                        let backoff = self.backoff(attempt);
                        warn!(
                            "{} returned {}, retrying after {:?} (attempt {})",
                            self.provider,
                            status,
                            backoff,
                            attempt + 1
                        );
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    if is_retryable_status(status) {
                        return Err(GatewayError::transient(
                            self.provider,
                            format!("HTTP {} after {} retries", status, self.max_retries),
                        ));
                    }

                    debug!("{} responded with {}", self.provider, status);
                    return Ok((status, body));
                }
                Err(e) => {
                    let message = e.to_string();
                    if attempt < self.max_retries {
                        let backoff = self.backoff(attempt);
                        warn!(
                            "{} request error, retrying after {:?} (attempt {}): {}",
                            self.provider,
                            backoff,
                            attempt + 1,
                            message
                        );
                        tokio::time::sleep(backoff).await;
                    }
                    last_error = Some(message);
                }
            }
        }

        Err(GatewayError::transient(
            self.provider,
            format!(
                "Request failed after {} retries: {}",
                self.max_retries,
                last_error.unwrap_or_else(|| "Unknown error".to_string())
            ),
        ))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff * 2_u32.pow(attempt)
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::BAD_GATEWAY
        || status == StatusCode::SERVICE_UNAVAILABLE
        || status == StatusCode::GATEWAY_TIMEOUT
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// OAuth access token cache
#[derive(Default)]
pub struct TokenCache {
    token: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached token, fetching a new one when missing or about to expire
    ///
    /// `fetch` resolves to the token and its lifetime in seconds.
    pub async fn get_or_refresh<F, Fut>(&self, fetch: F) -> GatewayResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = GatewayResult<(String, u64)>>,
    {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if Instant::now() + TOKEN_REFRESH_MARGIN < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let (value, expires_in) = fetch().await?;
        *guard = Some(CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(value)
    }
}

/// Read a numeric field providers send either as a JSON number or a string
pub fn flexible_u64(value: &serde_json::Value) -> Option<u64> {
    match value {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Render a code field providers send either as a JSON number or a string
pub fn flexible_code(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.trim().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_flexible_fields() {
        assert_eq!(flexible_u64(&json!("3599")), Some(3599));
        assert_eq!(flexible_u64(&json!(180)), Some(180));
        assert_eq!(flexible_u64(&json!(null)), None);
        assert_eq!(flexible_code(&json!(0)), Some("0".to_string()));
        assert_eq!(flexible_code(&json!("1032")), Some("1032".to_string()));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_retryable_status(StatusCode::BAD_REQUEST));
    }

    #[tokio::test]
    async fn test_token_cache_reuses_token() {
        let cache = TokenCache::new();
        let fetches = AtomicUsize::new(0);

        for _ in 0..3 {
            let token = cache
                .get_or_refresh(|| async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(("token-1".to_string(), 3600))
                })
                .await
                .unwrap();
            assert_eq!(token, "token-1");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_token_cache_refreshes_short_lived_token() {
        let cache = TokenCache::new();
        let fetches = AtomicUsize::new(0);

        for _ in 0..2 {
            cache
                .get_or_refresh(|| async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(("short".to_string(), 30))
                })
                .await
                .unwrap();
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
    }
}
