//! HTTP surface tests, driven through the router without a socket

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{setup, TestContext};
use kahawa_payments::api::{self, AppState};
use kahawa_payments::payments::types::{AttemptState, GatewayStatus};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(ctx: &TestContext) -> Router {
    api::router(AppState::new(ctx.coordinator.clone(), "development"))
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_initiate_and_poll_payment() {
    let ctx = setup().await;
    ctx.order("A1", dec!(1500)).await;

    let (status, body) = send(
        app(&ctx),
        post_json(
            "/api/payments",
            json!({
                "order_id": "A1",
                "provider": "mpesa",
                "phone_number": "+254712345678",
                "amount": "1500"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["state"], "awaiting_confirmation");
    let attempt_id = body["attempt_id"].as_str().unwrap().to_string();

    ctx.mpesa.report_success("NLJ7RT61SV");
    let (status, body) = send(app(&ctx), get(&format!("/api/payments/{}", attempt_id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "completed");
    assert_eq!(body["order_id"], "A1");
    assert_eq!(body["provider_receipt"], "NLJ7RT61SV");
    assert!(ctx.orders.is_paid("A1").await);
}

#[tokio::test]
async fn test_error_status_codes() {
    let ctx = setup().await;
    ctx.order("A2", dec!(500)).await;

    let request = |amount: &str| {
        post_json(
            "/api/payments",
            json!({
                "order_id": "A2",
                "provider": "airtel_money",
                "phone_number": "0733123456",
                "amount": amount
            }),
        )
    };

    let (status, body) = send(app(&ctx), request("0")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "INVALID_AMOUNT");

    let (status, _) = send(app(&ctx), request("500")).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(app(&ctx), request("500")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "DUPLICATE_ATTEMPT");
}

#[tokio::test]
async fn test_rejected_push_returns_payment_required() {
    let ctx = setup().await;
    ctx.order("A3", dec!(75)).await;
    ctx.mpesa.reject_push("Invalid PhoneNumber");

    let (status, body) = send(
        app(&ctx),
        post_json(
            "/api/payments",
            json!({
                "order_id": "A3",
                "provider": "mpesa",
                "phone_number": "0712345678",
                "amount": "75"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["error"]["code"], "GATEWAY_REJECTED");
}

#[tokio::test]
async fn test_unreachable_gateway_returns_service_unavailable() {
    let ctx = setup().await;
    ctx.order("A4", dec!(60)).await;

    let (_, body) = send(
        app(&ctx),
        post_json(
            "/api/payments",
            json!({
                "order_id": "A4",
                "provider": "mpesa",
                "phone_number": "0712345678",
                "amount": "60"
            }),
        ),
    )
    .await;
    let attempt_id = body["attempt_id"].as_str().unwrap().to_string();

    ctx.mpesa.fail_status_checks("connection reset");
    let (status, body) = send(app(&ctx), get(&format!("/api/payments/{}", attempt_id))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "GATEWAY_UNAVAILABLE");
}

#[tokio::test]
async fn test_unknown_attempt_and_bad_input() {
    let ctx = setup().await;

    let (status, _) = send(
        app(&ctx),
        get("/api/payments/0f8fad5b-d9cb-469f-a165-70867728950e"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(app(&ctx), get("/api/payments/not-a-uuid")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = send(
        app(&ctx),
        post_json("/api/payments", json!({ "order_id": "A5", "provider": "paypal" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_callback_resolves_attempt() {
    let ctx = setup().await;
    ctx.order("A6", dec!(320)).await;
    ctx.airtel.accept_push("airtel-a6");

    let (_, body) = send(
        app(&ctx),
        post_json(
            "/api/payments",
            json!({
                "order_id": "A6",
                "provider": "airtel_money",
                "phone_number": "0733123456",
                "amount": "320"
            }),
        ),
    )
    .await;
    let attempt_id = body["attempt_id"].as_str().unwrap().parse().unwrap();

    ctx.airtel.report(GatewayStatus::Success { receipt: None });
    let (status, body) = send(
        app(&ctx),
        post_json("/api/payments/callbacks/airtel", json!({ "reference": "airtel-a6" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "received");

    let attempt = ctx.coordinator.get_attempt(attempt_id).await.unwrap();
    assert_eq!(attempt.state, AttemptState::Completed);
}

#[tokio::test]
async fn test_callback_for_unknown_reference_is_acknowledged() {
    let ctx = setup().await;

    let (status, body) = send(
        app(&ctx),
        post_json("/api/payments/callbacks/mpesa", json!({ "reference": "ws_CO_nobody" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ResultCode"], 0);
}

#[tokio::test]
async fn test_callback_with_bad_signature_is_rejected() {
    let ctx = setup().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/payments/callbacks/airtel")
        .header("content-type", "application/json")
        .header("x-signature", "bad")
        .body(Body::from(json!({ "reference": "airtel-x" }).to_string()))
        .unwrap();
    let (status, body) = send(app(&ctx), request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "INVALID_SIGNATURE");
}

#[tokio::test]
async fn test_health_reports_providers() {
    let ctx = setup().await;

    let response = app(&ctx).oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));

    let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["database"], "disabled");
    assert_eq!(body["providers"], json!(["mpesa", "airtel_money"]));
}
