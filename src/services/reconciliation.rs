//! Reconciliation coordinator.
//!
//! Three ingress paths (client status checks, signed webhooks and unsigned
//! callbacks / IPNs) plus the expiry sweep all end in
//! `PaymentLedger::apply_outcome`. Provider calls are always made before the
//! ledger write, never while a payment is being updated.

use crate::database::payment_repository::{NewPayment, Payment, PaymentState};
use crate::error::{AppError, AppErrorKind, ExternalError};
use crate::middleware::logging::log_external_call;
use crate::payments::error::PaymentError;
use crate::payments::factory::ProviderRegistry;
use crate::payments::pricing::PricingTable;
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    CanonicalOutcome, HandleKind, Money, PaymentRequest, ProviderName, SubscriptionDuration,
    SubscriptionPlan,
};
use crate::payments::utils::generate_merchant_reference;
use crate::services::ledger::{LedgerError, LedgerUpdate, PaymentLedger};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReconciliationError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Invalid webhook signature from {0}")]
    InvalidSignature(ProviderName),

    #[error(transparent)]
    Provider(#[from] PaymentError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub type ReconciliationResult<T> = Result<T, ReconciliationError>;

impl From<ReconciliationError> for AppError {
    fn from(err: ReconciliationError) -> Self {
        match err {
            ReconciliationError::UnknownProvider(provider) => {
                AppError::invalid_value("provider", format!("provider '{}' is not enabled", provider))
            }
            ReconciliationError::InvalidSignature(provider) => {
                AppError::new(AppErrorKind::External(ExternalError::InvalidSignature {
                    provider: provider.to_string(),
                }))
            }
            ReconciliationError::Provider(e) => e.into(),
            ReconciliationError::Ledger(e) => e.into(),
        }
    }
}

/// Pages the PesaPal checkout redirect lands on.
#[derive(Debug, Clone)]
pub struct RedirectPages {
    pub success_url: String,
    pub failure_url: String,
    pub pending_url: String,
}

impl Default for RedirectPages {
    fn default() -> Self {
        Self {
            success_url: "http://localhost:3000/payment/success".to_string(),
            failure_url: "http://localhost:3000/payment/failed".to_string(),
            pending_url: "http://localhost:3000/payment/pending".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitiatePayment {
    pub subscription_plan: SubscriptionPlan,
    pub subscription_duration: SubscriptionDuration,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitiatedPayment {
    pub payment_id: Uuid,
    pub external_ref: String,
    pub merchant_reference: String,
    pub amount: Money,
    pub handle: HandleKind,
}

/// Result of a status check.
#[derive(Debug, Clone)]
pub enum StatusCheck {
    /// Already terminal; the provider was not asked.
    Settled(Payment),
    /// The provider answered and the answer went through the ledger.
    Reconciled(LedgerUpdate),
    /// The provider could not be asked. Not a payment failure; retry later.
    StatusCheckPending { payment: Payment, reason: String },
}

impl StatusCheck {
    pub fn payment(&self) -> &Payment {
        match self {
            StatusCheck::Settled(payment) => payment,
            StatusCheck::Reconciled(update) => &update.payment,
            StatusCheck::StatusCheckPending { payment, .. } => payment,
        }
    }

    pub fn is_check_pending(&self) -> bool {
        matches!(self, StatusCheck::StatusCheckPending { .. })
    }
}

#[derive(Debug, Clone)]
pub enum WebhookOutcome {
    Processed(LedgerUpdate),
    /// Authentic event that is not about a payment.
    Ignored,
    /// Authentic event for a payment this service does not know.
    UnknownPayment(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectTarget {
    Success,
    Failure,
    Pending,
}

impl RedirectTarget {
    fn for_state(state: PaymentState) -> Self {
        match state {
            PaymentState::Completed => RedirectTarget::Success,
            PaymentState::Failed | PaymentState::Refunded => RedirectTarget::Failure,
            PaymentState::Pending | PaymentState::Completing => RedirectTarget::Pending,
        }
    }
}

/// Payments the sweep works on at once.
const SWEEP_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SweepOutcome {
    Completed,
    Failed,
    Expired,
    Skipped,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub completed: usize,
    pub failed: usize,
    pub expired: usize,
    pub skipped: usize,
}

pub struct ReconciliationCoordinator {
    registry: ProviderRegistry,
    ledger: Arc<PaymentLedger>,
    pricing: PricingTable,
    pages: RedirectPages,
}

impl ReconciliationCoordinator {
    pub fn new(
        registry: ProviderRegistry,
        ledger: Arc<PaymentLedger>,
        pricing: PricingTable,
        pages: RedirectPages,
    ) -> Self {
        Self {
            registry,
            ledger,
            pricing,
            pages,
        }
    }

    pub fn ledger(&self) -> &PaymentLedger {
        &self.ledger
    }

    pub fn providers(&self) -> Vec<ProviderName> {
        self.registry.list_available_providers()
    }

    fn provider(&self, name: ProviderName) -> ReconciliationResult<Arc<dyn PaymentProvider>> {
        self.registry
            .get(name)
            .map_err(|_| ReconciliationError::UnknownProvider(name.to_string()))
    }

    /// Fails when an enabled provider charges in a currency the price table
    /// cannot quote every plan in. Run once at startup.
    pub fn check_pricing(&self) -> ReconciliationResult<()> {
        for name in self.registry.list_available_providers() {
            let currency = self.provider(name)?.default_currency();
            if let Err(e) = self.pricing.ensure_covers(currency) {
                error!(provider = %name, currency = %currency, error = %e, "Provider currency is not priced");
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Quotes the plan, opens the payment at the provider, then records it.
    pub async fn initiate(
        &self,
        provider_name: ProviderName,
        user_id: Uuid,
        request: InitiatePayment,
    ) -> ReconciliationResult<InitiatedPayment> {
        let provider = self.provider(provider_name)?;
        let amount = self.pricing.quote(
            request.subscription_plan,
            request.subscription_duration,
            provider.default_currency(),
        )?;
        amount.validate_positive("amount")?;

        let merchant_reference = generate_merchant_reference(provider_name);
        let plan = request.subscription_plan;
        let duration = request.subscription_duration;
        let provider_request = PaymentRequest {
            merchant_reference: merchant_reference.clone(),
            user_id,
            amount: amount.clone(),
            plan,
            duration,
            description: format!("{} {} subscription", plan.as_str(), duration.as_str()),
            email: request.email,
            phone_number: request.phone_number,
            callback_url: None,
        };
        let call = provider.initiate(provider_request);
        let handle = log_external_call(provider_name.as_str(), "initiate", call)
            .await
            .map_err(|e| {
                warn!(
                    provider = %provider_name,
                    merchant_reference = %merchant_reference,
                    error = %e,
                    "Payment initiation failed"
                );
                e
            })?;

        let payment = self
            .ledger
            .create(NewPayment {
                user_id,
                provider: provider_name,
                external_ref: handle.external_ref.clone(),
                merchant_reference: merchant_reference.clone(),
                amount: amount.clone(),
                subscription_plan: plan,
                subscription_duration: duration,
                provider_metadata: handle.metadata.clone(),
            })
            .await?;

        Ok(InitiatedPayment {
            payment_id: payment.id,
            external_ref: payment.external_ref,
            merchant_reference,
            amount,
            handle: handle.handle,
        })
    }

    pub async fn check_status(&self, payment_id: Uuid) -> ReconciliationResult<StatusCheck> {
        let payment = self.ledger.find_by_id(payment_id).await?;
        self.reconcile(payment).await
    }

    pub async fn check_status_by_reference(
        &self,
        provider: ProviderName,
        external_ref: &str,
    ) -> ReconciliationResult<StatusCheck> {
        let payment = self.ledger.find_by_reference(provider, external_ref).await?;
        self.reconcile(payment).await
    }

    async fn reconcile(&self, payment: Payment) -> ReconciliationResult<StatusCheck> {
        if payment.state.is_terminal() {
            return Ok(StatusCheck::Settled(payment));
        }

        let provider = self.provider(payment.provider)?;
        let query = provider.query_status(&payment.external_ref);
        match log_external_call(payment.provider.as_str(), "query_status", query).await {
            Ok(event) => {
                let update = match self.ledger.apply_outcome(&event).await {
                    Ok(update) => update,
                    Err(LedgerError::CompletionInProgress(payment_id)) => {
                        debug!(payment_id = %payment_id, "Completion in progress elsewhere");
                        let payment = self.ledger.find_by_id(payment_id).await?;
                        return Ok(StatusCheck::StatusCheckPending {
                            payment,
                            reason: "completion in progress".to_string(),
                        });
                    }
                    Err(e) => return Err(e.into()),
                };
                debug!(
                    payment_id = %update.payment.id,
                    state = %update.payment.state,
                    disposition = ?update.disposition,
                    "Status check applied"
                );
                Ok(StatusCheck::Reconciled(update))
            }
            Err(e) => {
                warn!(
                    payment_id = %payment.id,
                    provider = %payment.provider,
                    error = %e,
                    "Provider status query failed; payment left pending"
                );
                Ok(StatusCheck::StatusCheckPending {
                    payment,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Signed webhook. Only a bad signature or an internal failure is an
    /// error; unknown payments and unrelated events are acknowledged.
    pub async fn handle_webhook(
        &self,
        provider_name: ProviderName,
        payload: &[u8],
        signature: Option<&str>,
    ) -> ReconciliationResult<WebhookOutcome> {
        let provider = self.provider(provider_name)?;
        let signature = signature.ok_or_else(|| {
            warn!(provider = %provider_name, "Webhook without signature header");
            ReconciliationError::InvalidSignature(provider_name)
        })?;

        let event = match provider.parse_webhook(payload, signature) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(WebhookOutcome::Ignored),
            Err(PaymentError::InvalidSignature { message }) => {
                warn!(provider = %provider_name, reason = %message, "Rejected webhook signature");
                return Err(ReconciliationError::InvalidSignature(provider_name));
            }
            Err(e) => return Err(e.into()),
        };

        match self.ledger.apply_outcome(&event).await {
            Ok(update) => {
                info!(
                    provider = %provider_name,
                    external_ref = %event.external_ref,
                    outcome = ?event.outcome,
                    disposition = ?update.disposition,
                    "Webhook processed"
                );
                Ok(WebhookOutcome::Processed(update))
            }
            Err(LedgerError::PaymentNotFound(reference)) => {
                warn!(
                    provider = %provider_name,
                    external_ref = %reference,
                    "Webhook for unknown payment acknowledged"
                );
                Ok(WebhookOutcome::UnknownPayment(reference))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Unsigned callback / IPN. The body only says which payment to look at;
    /// the status comes from an authenticated query. Always returns the
    /// provider's acknowledgement body.
    pub async fn handle_provider_callback(
        &self,
        provider_name: ProviderName,
        payload: &[u8],
    ) -> ReconciliationResult<JsonValue> {
        let provider = self.provider(provider_name)?;
        let callback = match provider.parse_callback(payload) {
            Ok(callback) => callback,
            Err(e) => {
                warn!(provider = %provider_name, error = %e, "Unreadable provider callback");
                return Ok(provider.callback_ack(None));
            }
        };

        match self
            .check_status_by_reference(provider_name, &callback.tracking_ref)
            .await
        {
            Ok(check) => {
                info!(
                    provider = %provider_name,
                    tracking_ref = %callback.tracking_ref,
                    state = %check.payment().state,
                    "Provider callback handled"
                );
            }
            Err(ReconciliationError::Ledger(LedgerError::PaymentNotFound(_))) => {
                warn!(
                    provider = %provider_name,
                    tracking_ref = %callback.tracking_ref,
                    "Callback for unknown payment acknowledged"
                );
            }
            Err(e) => {
                error!(
                    provider = %provider_name,
                    tracking_ref = %callback.tracking_ref,
                    error = %e,
                    "Provider callback processing failed"
                );
            }
        }

        Ok(provider.callback_ack(Some(&callback)))
    }

    /// Browser redirect after hosted checkout.
    pub async fn handle_redirect(
        &self,
        provider_name: ProviderName,
        tracking_ref: &str,
    ) -> RedirectTarget {
        match self.check_status_by_reference(provider_name, tracking_ref).await {
            Ok(check) => RedirectTarget::for_state(check.payment().state),
            Err(ReconciliationError::Ledger(LedgerError::PaymentNotFound(_))) => {
                warn!(provider = %provider_name, tracking_ref = %tracking_ref, "Redirect for unknown payment");
                RedirectTarget::Failure
            }
            Err(e) => {
                warn!(provider = %provider_name, tracking_ref = %tracking_ref, error = %e, "Redirect status check failed");
                RedirectTarget::Pending
            }
        }
    }

    /// Page to send the browser to, carrying the tracking reference.
    pub fn redirect_location(&self, target: RedirectTarget, tracking_ref: &str) -> String {
        let base = match target {
            RedirectTarget::Success => &self.pages.success_url,
            RedirectTarget::Failure => &self.pages.failure_url,
            RedirectTarget::Pending => &self.pages.pending_url,
        };
        reqwest::Url::parse_with_params(base, &[("reference", tracking_ref)])
            .map(|url| url.to_string())
            .unwrap_or_else(|_| base.clone())
    }

    /// Gives every payment still pending before `cutoff` one last provider
    /// query. Confirmed outcomes are applied; anything still pending expires.
    /// Payments whose provider cannot be asked stay for the next sweep, as do
    /// payments another worker is completing.
    pub async fn sweep_stale_pending(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> ReconciliationResult<SweepReport> {
        use futures::stream::{self, StreamExt};

        let stale = self.ledger.pending_older_than(cutoff, limit).await?;
        let mut report = SweepReport {
            examined: stale.len(),
            ..SweepReport::default()
        };

        let outcomes: Vec<SweepOutcome> = stream::iter(stale)
            .map(|payment| self.sweep_one(payment))
            .buffer_unordered(SWEEP_CONCURRENCY)
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                SweepOutcome::Completed => report.completed += 1,
                SweepOutcome::Failed => report.failed += 1,
                SweepOutcome::Expired => report.expired += 1,
                SweepOutcome::Skipped => report.skipped += 1,
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                completed = report.completed,
                failed = report.failed,
                expired = report.expired,
                skipped = report.skipped,
                "Pending payment sweep finished"
            );
        }
        Ok(report)
    }

    async fn sweep_one(&self, payment: Payment) -> SweepOutcome {
        let provider = match self.provider(payment.provider) {
            Ok(provider) => provider,
            Err(_) => {
                warn!(payment_id = %payment.id, provider = %payment.provider, "Provider disabled; cannot sweep");
                return SweepOutcome::Skipped;
            }
        };

        let event = match provider.query_status(&payment.external_ref).await {
            Ok(event) => event,
            Err(e) => {
                warn!(payment_id = %payment.id, error = %e, "Sweep status query failed");
                return SweepOutcome::Skipped;
            }
        };

        let result = match event.outcome {
            CanonicalOutcome::Pending => self.ledger.expire(payment.id).await,
            CanonicalOutcome::Succeeded | CanonicalOutcome::Failed => {
                self.ledger.apply_outcome(&event).await
            }
        };

        match result {
            Ok(update) => match (event.outcome, update.payment.state) {
                (_, PaymentState::Pending | PaymentState::Completing) => SweepOutcome::Skipped,
                (CanonicalOutcome::Pending, PaymentState::Failed) => SweepOutcome::Expired,
                (_, PaymentState::Completed) => SweepOutcome::Completed,
                (_, _) => SweepOutcome::Failed,
            },
            Err(LedgerError::CompletionInProgress(_)) => {
                debug!(payment_id = %payment.id, "Payment is being completed; left for the next sweep");
                SweepOutcome::Skipped
            }
            Err(e) => {
                error!(payment_id = %payment.id, error = %e, "Sweep could not settle payment");
                SweepOutcome::Skipped
            }
        }
    }
}
