#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use kahawa_payments::payments::clock::ManualClock;
use kahawa_payments::payments::error::{GatewayError, GatewayResult};
use kahawa_payments::payments::memory::{InMemoryAttemptStore, InMemoryOrderStore};
use kahawa_payments::payments::traits::PaymentGateway;
use kahawa_payments::payments::types::{CallbackNotice, GatewayStatus, Provider, PushRequest};
use kahawa_payments::payments::{CoordinatorConfig, PaymentConfirmationCoordinator};
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Gateway whose answers are set by the test
pub struct ScriptedGateway {
    provider: Provider,
    push_result: Mutex<GatewayResult<String>>,
    status: Mutex<GatewayResult<GatewayStatus>>,
    push_calls: AtomicUsize,
    status_calls: AtomicUsize,
    push_delay: Mutex<Option<Duration>>,
}

impl ScriptedGateway {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            push_result: Mutex::new(Ok("ws_CO_TEST".to_string())),
            status: Mutex::new(Ok(GatewayStatus::Pending)),
            push_calls: AtomicUsize::new(0),
            status_calls: AtomicUsize::new(0),
            push_delay: Mutex::new(None),
        }
    }

    pub fn accept_push(&self, reference: &str) {
        *self.push_result.lock().unwrap() = Ok(reference.to_string());
    }

    pub fn reject_push(&self, message: &str) {
        *self.push_result.lock().unwrap() = Err(GatewayError::rejected(self.provider, message));
    }

    pub fn delay_push(&self, delay: Duration) {
        *self.push_delay.lock().unwrap() = Some(delay);
    }

    pub fn report(&self, status: GatewayStatus) {
        *self.status.lock().unwrap() = Ok(status);
    }

    pub fn report_success(&self, receipt: &str) {
        self.report(GatewayStatus::Success {
            receipt: Some(receipt.to_string()),
        });
    }

    pub fn fail_status_checks(&self, message: &str) {
        *self.status.lock().unwrap() = Err(GatewayError::transient(self.provider, message));
    }

    pub fn push_calls(&self) -> usize {
        self.push_calls.load(Ordering::SeqCst)
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn push(&self, _request: &PushRequest) -> GatewayResult<String> {
        self.push_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.push_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.push_result.lock().unwrap().clone()
    }

    async fn check_status(&self, _reference: &str) -> GatewayResult<GatewayStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.status.lock().unwrap().clone()
    }

    fn validate_callback_signature(&self, _payload: &[u8], signature: Option<&str>) -> bool {
        signature != Some("bad")
    }

    /// Test callbacks are `{"reference": "..."}`
    fn parse_callback(&self, payload: &[u8]) -> GatewayResult<CallbackNotice> {
        let value: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| GatewayError::rejected(self.provider, e.to_string()))?;
        let reference = value["reference"]
            .as_str()
            .ok_or_else(|| GatewayError::rejected(self.provider, "missing reference"))?;
        Ok(CallbackNotice {
            provider_reference: reference.to_string(),
            reported: GatewayStatus::Pending,
        })
    }
}

pub struct TestContext {
    pub coordinator: Arc<PaymentConfirmationCoordinator>,
    pub attempts: Arc<InMemoryAttemptStore>,
    pub orders: Arc<InMemoryOrderStore>,
    pub mpesa: Arc<ScriptedGateway>,
    pub airtel: Arc<ScriptedGateway>,
    pub clock: Arc<ManualClock>,
}

pub fn start_time() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
}

pub async fn setup() -> TestContext {
    let attempts = Arc::new(InMemoryAttemptStore::new());
    let orders = Arc::new(InMemoryOrderStore::new());
    let mpesa = Arc::new(ScriptedGateway::new(Provider::Mpesa));
    let airtel = Arc::new(ScriptedGateway::new(Provider::AirtelMoney));
    let clock = Arc::new(ManualClock::new(start_time()));

    let coordinator = PaymentConfirmationCoordinator::new(
        attempts.clone(),
        orders.clone(),
        CoordinatorConfig::default(),
    )
    .with_clock(clock.clone())
    .with_gateway(mpesa.clone())
    .with_gateway(airtel.clone());

    TestContext {
        coordinator: Arc::new(coordinator),
        attempts,
        orders,
        mpesa,
        airtel,
        clock,
    }
}

impl TestContext {
    pub async fn order(&self, order_id: &str, due: Decimal) {
        self.orders.insert_order(order_id, due).await;
    }
}
