mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use common::{Harness, Scripted, ScriptedProvider};
use serde_json::{json, Value};
use std::sync::Arc;
use streamflix_backend::api::{build_router, AppState};
use streamflix_backend::database::payment_repository::PaymentState;
use streamflix_backend::health::HealthChecker;
use streamflix_backend::payments::provider::PaymentProvider;
use streamflix_backend::payments::providers::stripe::{StripeConfig, StripeProvider};
use streamflix_backend::payments::types::CanonicalOutcome;
use streamflix_backend::payments::utils::hmac_sha256_hex;
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "admin-secret";
const WEBHOOK_SECRET: &str = "whsec_api";

async fn app(answer: Scripted) -> (Router, Harness, Arc<ScriptedProvider>) {
    let provider = Arc::new(ScriptedProvider::new(answer));
    let stripe: Arc<dyn PaymentProvider> = Arc::new(
        StripeProvider::new(StripeConfig {
            secret_key: "sk_test_api".to_string(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
            ..StripeConfig::default()
        })
        .unwrap(),
    );
    let harness = Harness::new(vec![provider.clone() as Arc<dyn PaymentProvider>, stripe]).await;
    let router = build_router(AppState {
        coordinator: harness.coordinator.clone(),
        health_checker: HealthChecker::new(),
        admin_token: Some(ADMIN_TOKEN.to_string()),
    });
    (router, harness, provider)
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn initiate_request(user_id: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/payments/pesapal/initiate")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-user-id", user_id)
        .body(Body::from(
            json!({"subscription_plan": "premium", "subscription_duration": "monthly"}).to_string(),
        ))
        .unwrap()
}

async fn initiate(router: &Router, harness: &Harness) -> Value {
    let response = router
        .clone()
        .oneshot(initiate_request(&harness.user_id.to_string()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    json_body(response).await["data"].clone()
}

#[tokio::test]
async fn health_lists_enabled_providers() {
    let (router, _, _) = app(Scripted::Outcome(CanonicalOutcome::Pending)).await;

    let response = router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await;
    let providers = body["providers"].as_array().unwrap();
    assert_eq!(providers.len(), 2);
}

#[tokio::test]
async fn initiate_returns_created_payment() {
    let (router, harness, _) = app(Scripted::Outcome(CanonicalOutcome::Pending)).await;

    let data = initiate(&router, &harness).await;

    assert!(data["payment_id"].is_string());
    assert!(data["merchant_reference"].as_str().unwrap().starts_with("PSP-"));
    assert_eq!(harness.payments.len().await, 1);
}

#[tokio::test]
async fn initiate_without_user_header_is_bad_request() {
    let (router, harness, _) = app(Scripted::Outcome(CanonicalOutcome::Pending)).await;

    let request = Request::builder()
        .method("POST")
        .uri("/payments/pesapal/initiate")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"subscription_plan": "basic", "subscription_duration": "yearly"}).to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(harness.payments.is_empty().await);
}

#[tokio::test]
async fn unknown_provider_in_path_is_bad_request() {
    let (router, harness, _) = app(Scripted::Outcome(CanonicalOutcome::Pending)).await;

    let request = Request::builder()
        .method("POST")
        .uri("/payments/paypal/initiate")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-user-id", harness.user_id.to_string())
        .body(Body::from(
            json!({"subscription_plan": "basic", "subscription_duration": "monthly"}).to_string(),
        ))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn status_endpoint_reconciles_with_provider() {
    let (router, harness, provider) = app(Scripted::Outcome(CanonicalOutcome::Pending)).await;
    let data = initiate(&router, &harness).await;
    let external_ref = data["external_ref"].as_str().unwrap().to_string();

    provider.answer(Scripted::Outcome(CanonicalOutcome::Succeeded));
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/payments/pesapal/status/{}", external_ref))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["payment"]["state"], "completed");
    assert_eq!(body["data"]["check_pending"], false);
    assert!(body["data"]["payment"].get("provider_metadata").is_none());
}

#[tokio::test]
async fn missing_payment_is_not_found() {
    let (router, _, _) = app(Scripted::Outcome(CanonicalOutcome::Pending)).await;

    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/payments/id/{}", uuid::Uuid::new_v4()))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn history_lists_user_payments() {
    let (router, harness, _) = app(Scripted::Outcome(CanonicalOutcome::Pending)).await;
    initiate(&router, &harness).await;
    initiate(&router, &harness).await;

    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/users/{}/payments?limit=1", harness.user_id))
                .header("x-user-id", harness.user_id.to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn history_of_another_user_is_forbidden() {
    let (router, harness, _) = app(Scripted::Outcome(CanonicalOutcome::Pending)).await;
    initiate(&router, &harness).await;

    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/users/{}/payments", harness.user_id))
                .header("x-user-id", uuid::Uuid::new_v4().to_string())
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = json_body(response).await;
    assert_eq!(body["error"], "UNAUTHORIZED");
}

#[tokio::test]
async fn history_without_user_header_is_bad_request() {
    let (router, harness, _) = app(Scripted::Outcome(CanonicalOutcome::Pending)).await;

    let response = router
        .oneshot(
            Request::builder()
                .uri(format!("/users/{}/payments", harness.user_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn forged_stripe_webhook_is_unauthorized() {
    let (router, _, _) = app(Scripted::Outcome(CanonicalOutcome::Pending)).await;

    let body = json!({
        "id": "evt_forged",
        "type": "payment_intent.succeeded",
        "data": {"object": {"id": "pi_x", "status": "succeeded", "amount": 899, "currency": "usd"}}
    })
    .to_string();
    let timestamp = Utc::now().timestamp();
    let signature = hmac_sha256_hex("whsec_wrong", format!("{}.{}", timestamp, body).as_bytes())
        .unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/payments/stripe/webhook")
                .header("stripe-signature", format!("t={},v1={}", timestamp, signature))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn signed_webhook_for_unknown_payment_is_acknowledged() {
    let (router, harness, _) = app(Scripted::Outcome(CanonicalOutcome::Pending)).await;

    let body = json!({
        "id": "evt_unknown",
        "type": "payment_intent.succeeded",
        "data": {"object": {"id": "pi_unknown", "status": "succeeded", "amount": 899, "currency": "usd"}}
    })
    .to_string();
    let timestamp = Utc::now().timestamp();
    let signature =
        hmac_sha256_hex(WEBHOOK_SECRET, format!("{}.{}", timestamp, body).as_bytes()).unwrap();

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/payments/stripe/webhook")
                .header("stripe-signature", format!("t={},v1={}", timestamp, signature))
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["status"], "ok");
    assert!(harness.payments.is_empty().await);
}

#[tokio::test]
async fn ipn_is_acknowledged_and_reconciled() {
    let (router, harness, provider) = app(Scripted::Outcome(CanonicalOutcome::Succeeded)).await;
    let data = initiate(&router, &harness).await;
    let external_ref = data["external_ref"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/payments/pesapal/ipn")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"OrderTrackingId": external_ref, "OrderNotificationType": "IPNCHANGE"})
                        .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["reference"], external_ref.as_str());
    assert_eq!(provider.queries(), 1);
    assert_eq!(harness.users.extensions(), 1);
}

#[tokio::test]
async fn checkout_redirect_points_at_result_page() {
    let (router, harness, _) = app(Scripted::Outcome(CanonicalOutcome::Succeeded)).await;
    let data = initiate(&router, &harness).await;
    let external_ref = data["external_ref"].as_str().unwrap().to_string();

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/payments/pesapal/callback?OrderTrackingId={}&OrderMerchantReference=x",
                    external_ref
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    let location = response.headers()[header::LOCATION].to_str().unwrap();
    assert!(location.starts_with("http://localhost:3000/payment/success?reference="));

    let missing = router
        .oneshot(
            Request::builder()
                .uri("/payments/pesapal/callback")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn refund_requires_admin_token() {
    let (router, harness, _) = app(Scripted::Outcome(CanonicalOutcome::Succeeded)).await;
    let data = initiate(&router, &harness).await;
    let payment_id = data["payment_id"].as_str().unwrap().to_string();
    harness
        .coordinator
        .check_status(payment_id.parse().unwrap())
        .await
        .unwrap();

    let refund = |token: Option<&str>| {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/admin/payments/{}/refund", payment_id))
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header("x-admin-token", token);
        }
        builder
            .body(Body::from(json!({"reason": "duplicate charge"}).to_string()))
            .unwrap()
    };

    let denied = router.clone().oneshot(refund(Some("guess"))).await.unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);
    let anonymous = router.clone().oneshot(refund(None)).await.unwrap();
    assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);

    let allowed = router.clone().oneshot(refund(Some(ADMIN_TOKEN))).await.unwrap();
    assert_eq!(allowed.status(), StatusCode::OK);
    assert_eq!(json_body(allowed).await["data"]["state"], "refunded");

    let again = router.oneshot(refund(Some(ADMIN_TOKEN))).await.unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);

    let payment = harness
        .coordinator
        .ledger()
        .find_by_id(payment_id.parse().unwrap())
        .await
        .unwrap();
    assert_eq!(payment.state, PaymentState::Refunded);
}
