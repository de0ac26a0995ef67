use crate::api::AppState;
use crate::database::payment_repository::{Payment, PaymentState};
use crate::error::AppError;
use crate::middleware::error::{get_request_id_from_headers, success_response};
use crate::payments::types::{
    Currency, ProviderName, SubscriptionDuration, SubscriptionPlan,
};
use crate::payments::utils::secure_eq;
use crate::services::reconciliation::{InitiatePayment, StatusCheck};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

const USER_ID_HEADER: &str = "x-user-id";
const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const DEFAULT_HISTORY_LIMIT: i64 = 50;
const MAX_HISTORY_LIMIT: i64 = 200;

/// Payment as exposed to clients. Provider metadata stays internal.
#[derive(Debug, Serialize, Deserialize)]
pub struct PaymentView {
    pub id: Uuid,
    pub provider: ProviderName,
    pub external_ref: String,
    pub merchant_reference: String,
    pub amount: String,
    pub currency: Currency,
    pub state: PaymentState,
    pub subscription_plan: SubscriptionPlan,
    pub subscription_duration: SubscriptionDuration,
    pub failure_reason: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&Payment> for PaymentView {
    fn from(payment: &Payment) -> Self {
        Self {
            id: payment.id,
            provider: payment.provider,
            external_ref: payment.external_ref.clone(),
            merchant_reference: payment.merchant_reference.clone(),
            amount: payment.amount.to_string(),
            currency: payment.currency,
            // A completion claim is internal; clients keep seeing pending.
            state: match payment.state {
                PaymentState::Completing => PaymentState::Pending,
                state => state,
            },
            subscription_plan: payment.subscription_plan,
            subscription_duration: payment.subscription_duration,
            failure_reason: payment.failure_reason.clone(),
            completed_at: payment.completed_at,
            created_at: payment.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub payment: PaymentView,
    /// True when the provider could not be reached; poll again later.
    pub check_pending: bool,
}

impl From<StatusCheck> for StatusResponse {
    fn from(check: StatusCheck) -> Self {
        Self {
            payment: PaymentView::from(check.payment()),
            check_pending: check.is_check_pending(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub reason: String,
}

pub(crate) fn parse_provider(raw: &str) -> Result<ProviderName, AppError> {
    ProviderName::from_str(raw).map_err(AppError::from)
}

fn user_id_from_headers(headers: &HeaderMap) -> Result<Uuid, AppError> {
    let raw = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::missing_field(USER_ID_HEADER))?;
    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::invalid_value(USER_ID_HEADER, "must be a UUID"))
}

fn authorize_admin(state: &AppState, headers: &HeaderMap) -> Result<(), AppError> {
    let expected = state
        .admin_token
        .as_deref()
        .ok_or_else(|| AppError::unauthorized("administrative routes are disabled"))?;
    let presented = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if secure_eq(presented.as_bytes(), expected.as_bytes()) {
        Ok(())
    } else {
        Err(AppError::unauthorized("invalid admin token"))
    }
}

/// POST /payments/{provider}/initiate
pub async fn initiate_payment(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Json(request): Json<InitiatePayment>,
) -> Result<impl IntoResponse, AppError> {
    let request_id = get_request_id_from_headers(&headers);
    let with_request_id = |e: AppError| match &request_id {
        Some(id) => e.with_request_id(id.clone()),
        None => e,
    };

    let provider = parse_provider(&provider).map_err(with_request_id)?;
    let user_id = user_id_from_headers(&headers).map_err(with_request_id)?;

    let initiated = state
        .coordinator
        .initiate(provider, user_id, request)
        .await
        .map_err(|e| with_request_id(e.into()))?;

    info!(
        payment_id = %initiated.payment_id,
        provider = %provider,
        user_id = %user_id,
        "Payment initiated"
    );
    Ok((StatusCode::CREATED, success_response(initiated)))
}

/// GET /payments/{provider}/status/{external_ref}
pub async fn get_payment_status(
    State(state): State<AppState>,
    Path((provider, external_ref)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let provider = parse_provider(&provider)?;
    let check = state
        .coordinator
        .check_status_by_reference(provider, &external_ref)
        .await?;
    Ok(success_response(StatusResponse::from(check)))
}

/// GET /payments/id/{payment_id}
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let check = state.coordinator.check_status(payment_id).await?;
    Ok(success_response(StatusResponse::from(check)))
}

/// GET /users/{user_id}/payments
///
/// Callers only see their own history.
pub async fn list_user_payments(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, AppError> {
    if user_id_from_headers(&headers)? != user_id {
        return Err(AppError::unauthorized("payment history belongs to another user"));
    }
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let payments = state.coordinator.ledger().history(user_id, limit).await?;
    let views: Vec<PaymentView> = payments.iter().map(PaymentView::from).collect();
    Ok(success_response(views))
}

/// POST /admin/payments/{payment_id}/refund
pub async fn refund_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<RefundRequest>,
) -> Result<impl IntoResponse, AppError> {
    authorize_admin(&state, &headers)?;
    let reason = request.reason.trim();
    if reason.is_empty() {
        return Err(AppError::missing_field("reason"));
    }

    let refunded = state.coordinator.ledger().refund(payment_id, reason).await?;
    Ok(success_response(PaymentView::from(&refunded)))
}
