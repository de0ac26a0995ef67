//! HTTP surface for payments.

pub mod payments;
pub mod webhooks;

use crate::health::{HealthChecker, HealthStatus};
use crate::middleware::logging::{request_logging_middleware, UuidRequestId};
use crate::services::reconciliation::ReconciliationCoordinator;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::error;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<ReconciliationCoordinator>,
    pub health_checker: HealthChecker,
    pub admin_token: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/payments/{provider}/initiate",
            post(payments::initiate_payment),
        )
        .route(
            "/payments/{provider}/status/{external_ref}",
            get(payments::get_payment_status),
        )
        .route("/payments/id/{payment_id}", get(payments::get_payment))
        .route("/users/{user_id}/payments", get(payments::list_user_payments))
        .route(
            "/admin/payments/{payment_id}/refund",
            post(payments::refund_payment),
        )
        .route("/payments/{provider}/webhook", post(webhooks::handle_webhook))
        .route(
            "/payments/{provider}/callback",
            get(webhooks::handle_redirect).post(webhooks::handle_callback),
        )
        .route("/payments/{provider}/ipn", post(webhooks::handle_callback))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
                .layer(TraceLayer::new_for_http())
                .layer(axum::middleware::from_fn(request_logging_middleware))
                .layer(PropagateRequestIdLayer::x_request_id()),
        )
}

async fn health(
    State(state): State<AppState>,
) -> Result<Json<HealthStatus>, (StatusCode, Json<HealthStatus>)> {
    let providers = state
        .coordinator
        .providers()
        .iter()
        .map(|p| p.to_string())
        .collect();
    let status = state.health_checker.check_health(providers).await;

    if status.is_healthy() {
        Ok(Json(status))
    } else {
        error!("Health check failed - service unhealthy");
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(status)))
    }
}
