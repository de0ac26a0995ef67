use crate::api::payments::parse_provider;
use crate::api::AppState;
use crate::error::AppError;
use crate::services::reconciliation::{ReconciliationError, WebhookOutcome};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

/// POST /payments/{provider}/webhook
///
/// Takes the raw body: the signature covers the exact bytes sent.
pub async fn handle_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(provider) => provider,
        Err(e) => return e.into_response(),
    };
    info!(provider = %provider, bytes = body.len(), "Received webhook");

    let signature = headers
        .get(STRIPE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match state
        .coordinator
        .handle_webhook(provider, &body, signature)
        .await
    {
        Ok(WebhookOutcome::Processed(update)) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "payment_id": update.payment.id,
                "disposition": update.disposition,
            })),
        )
            .into_response(),
        Ok(WebhookOutcome::Ignored) | Ok(WebhookOutcome::UnknownPayment(_)) => {
            (StatusCode::OK, Json(json!({"status": "ok"}))).into_response()
        }
        Err(ReconciliationError::InvalidSignature(_)) => {
            warn!(provider = %provider, "Invalid webhook signature");
            AppError::from(ReconciliationError::InvalidSignature(provider)).into_response()
        }
        Err(e) => {
            // Non-2xx makes the provider redeliver; reapplying is idempotent.
            error!(provider = %provider, error = %e, "Webhook processing failed");
            AppError::from(e)
                .with_context(format!("{} webhook", provider))
                .into_response()
        }
    }
}

/// POST /payments/{provider}/ipn and POST /payments/{provider}/callback
pub async fn handle_callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    body: Bytes,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(provider) => provider,
        Err(e) => return e.into_response(),
    };
    info!(provider = %provider, bytes = body.len(), "Received provider notification");

    match state
        .coordinator
        .handle_provider_callback(provider, &body)
        .await
    {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(e) => AppError::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct RedirectQuery {
    #[serde(rename = "OrderTrackingId")]
    pub order_tracking_id: Option<String>,
    #[serde(rename = "OrderMerchantReference")]
    pub order_merchant_reference: Option<String>,
}

/// GET /payments/{provider}/callback
///
/// Browser redirect after hosted checkout. Answers with 303 to the page
/// matching the payment's state.
pub async fn handle_redirect(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(query): Query<RedirectQuery>,
) -> Response {
    let provider = match parse_provider(&provider) {
        Ok(provider) => provider,
        Err(e) => return e.into_response(),
    };
    let tracking_ref = match query.order_tracking_id.filter(|r| !r.trim().is_empty()) {
        Some(tracking_ref) => tracking_ref,
        None => return AppError::missing_field("OrderTrackingId").into_response(),
    };

    let target = state
        .coordinator
        .handle_redirect(provider, &tracking_ref)
        .await;
    info!(
        provider = %provider,
        tracking_ref = %tracking_ref,
        merchant_reference = ?query.order_merchant_reference,
        target = ?target,
        "Checkout redirect"
    );

    let location = state.coordinator.redirect_location(target, &tracking_ref);
    Redirect::to(&location).into_response()
}
