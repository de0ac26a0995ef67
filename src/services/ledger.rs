//! Payment ledger: the state machine over persisted payments.
//!
//! `apply_outcome` is the only path that moves a payment out of `Pending` on
//! behalf of a provider. Every state change goes through the store's
//! compare-and-swap, so concurrent callers observing the same outcome produce
//! one transition and one subscription extension between them.
//!
//! Completion is two steps: a `Completing` claim taken before the subscription
//! is extended, settled to `Completed` only once the extension succeeded.
//! Callers that meet a live claim get `CompletionInProgress` and retry.

use crate::database::error::DatabaseError;
use crate::database::payment_repository::{
    NewPayment, Payment, PaymentState, PaymentStore, StateChange, TransitionResult,
};
use crate::error::{AppError, AppErrorKind, DomainError, InfrastructureError};
use crate::payments::types::{CanonicalOutcome, ProviderName, ProviderPayload, ProviderStatusEvent};
use crate::services::notification::Notifier;
use crate::services::subscription::SubscriptionExtender;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const EXPIRED_REASON: &str = "expired";

/// A completion claim untouched for this long is treated as abandoned.
pub const COMPLETION_CLAIM_TTL_SECS: i64 = 120;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Payment not found: {0}")]
    PaymentNotFound(String),

    #[error("Duplicate payment reference: {0}")]
    DuplicateReference(String),

    #[error("Payment {payment_id} cannot move from {from} to {to}")]
    InvalidTransition {
        payment_id: Uuid,
        from: PaymentState,
        to: PaymentState,
    },

    #[error("Subscription extension failed for payment {payment_id}: {reason}")]
    SubscriptionExtensionFailed { payment_id: Uuid, reason: String },

    #[error("Payment {0} is being completed by another worker")]
    CompletionInProgress(Uuid),

    #[error(transparent)]
    Store(#[from] DatabaseError),
}

pub type LedgerResult<T> = Result<T, LedgerError>;

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::PaymentNotFound(reference) => AppError::payment_not_found(reference),
            LedgerError::DuplicateReference(reference) => {
                AppError::new(AppErrorKind::Domain(DomainError::DuplicatePayment { reference }))
            }
            LedgerError::InvalidTransition {
                payment_id,
                from,
                to,
            } => AppError::new(AppErrorKind::Domain(DomainError::InvalidStateTransition {
                payment_id: payment_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            })),
            LedgerError::SubscriptionExtensionFailed { payment_id, reason } => AppError::new(
                AppErrorKind::Infrastructure(InfrastructureError::SubscriptionExtension {
                    payment_id: payment_id.to_string(),
                    reason,
                }),
            ),
            LedgerError::CompletionInProgress(payment_id) => {
                AppError::new(AppErrorKind::Domain(DomainError::CompletionInProgress {
                    payment_id: payment_id.to_string(),
                }))
            }
            LedgerError::Store(e) => e.into(),
        }
    }
}

/// What `apply_outcome` did with an event.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The payment moved to a new state.
    Applied,
    /// The payment was already terminal; nothing was written.
    StaleTerminalState,
    /// Still pending; provider identifiers were recorded.
    MetadataMerged,
}

#[derive(Debug, Clone)]
pub struct LedgerUpdate {
    pub payment: Payment,
    pub disposition: Disposition,
}

impl LedgerUpdate {
    fn new(payment: Payment, disposition: Disposition) -> Self {
        Self {
            payment,
            disposition,
        }
    }
}

pub struct PaymentLedger {
    store: Arc<dyn PaymentStore>,
    extender: SubscriptionExtender,
    notifier: Arc<dyn Notifier>,
}

impl PaymentLedger {
    pub fn new(
        store: Arc<dyn PaymentStore>,
        extender: SubscriptionExtender,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            extender,
            notifier,
        }
    }

    pub async fn create(&self, payment: NewPayment) -> LedgerResult<Payment> {
        let reference = payment.external_ref.clone();
        match self.store.insert(payment).await {
            Ok(created) => {
                info!(
                    payment_id = %created.id,
                    provider = %created.provider,
                    external_ref = %created.external_ref,
                    amount = %created.amount,
                    currency = %created.currency,
                    "Payment created"
                );
                Ok(created)
            }
            Err(e) if e.is_unique_violation() => {
                warn!(external_ref = %reference, "Payment reference collision");
                Err(LedgerError::DuplicateReference(reference))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_by_id(&self, payment_id: Uuid) -> LedgerResult<Payment> {
        self.store
            .find_by_id(payment_id)
            .await?
            .ok_or_else(|| LedgerError::PaymentNotFound(payment_id.to_string()))
    }

    pub async fn find_by_reference(
        &self,
        provider: ProviderName,
        external_ref: &str,
    ) -> LedgerResult<Payment> {
        self.store
            .find_by_reference(provider, external_ref)
            .await?
            .ok_or_else(|| LedgerError::PaymentNotFound(external_ref.to_string()))
    }

    pub async fn history(&self, user_id: Uuid, limit: i64) -> LedgerResult<Vec<Payment>> {
        Ok(self.store.find_by_user(user_id, limit).await?)
    }

    pub async fn pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> LedgerResult<Vec<Payment>> {
        Ok(self.store.find_pending_older_than(cutoff, limit).await?)
    }

    /// Applies a normalized provider event to the payment it references.
    pub async fn apply_outcome(&self, event: &ProviderStatusEvent) -> LedgerResult<LedgerUpdate> {
        let payment = self
            .find_by_reference(event.provider(), &event.external_ref)
            .await?;
        let payment = self.settle_claim(payment).await?;

        if payment.state.is_terminal() {
            debug!(
                payment_id = %payment.id,
                state = %payment.state,
                outcome = ?event.outcome,
                "Ignoring outcome for terminal payment"
            );
            return Ok(LedgerUpdate::new(payment, Disposition::StaleTerminalState));
        }

        if let Some(reported) = amount_mismatch(&payment, &event.payload) {
            warn!(
                payment_id = %payment.id,
                quoted_amount = %payment.amount,
                reported_amount = %reported,
                currency = %payment.currency,
                "Provider reported a different amount; keeping the quoted amount"
            );
        }

        let mut patch = event.payload.to_metadata();
        if let Some(fields) = patch.as_object_mut() {
            fields.insert("last_provider_status".to_string(), json!(event.raw_status));
        }

        match event.outcome {
            CanonicalOutcome::Pending => match self.store.merge_metadata(payment.id, patch).await? {
                Some(payment) => Ok(LedgerUpdate::new(payment, Disposition::MetadataMerged)),
                None => {
                    let current = self.find_by_id(payment.id).await?;
                    debug!(payment_id = %current.id, state = %current.state, "Pending outcome arrived after settlement");
                    settled_elsewhere(current)
                }
            },
            CanonicalOutcome::Failed => {
                let reason = event
                    .payload
                    .failure_reason()
                    .unwrap_or_else(|| event.raw_status.clone());
                self.fail(payment.id, reason, patch).await
            }
            CanonicalOutcome::Succeeded => self.complete(payment.id, patch).await,
        }
    }

    /// Claims the payment (`Pending -> Completing`), extends the subscription,
    /// then settles the claim. Only the claim holder extends, and a payment is
    /// never `Completed` before its subscription is.
    async fn complete(&self, payment_id: Uuid, patch: serde_json::Value) -> LedgerResult<LedgerUpdate> {
        let claim = StateChange {
            to: PaymentState::Completing,
            completed_at: None,
            failure_reason: None,
            metadata_patch: json!({ "completion_claimed_at": Utc::now() }),
        };
        let claimed = match self.transition(payment_id, PaymentState::Pending, claim).await? {
            TransitionResult::Applied(payment) => payment,
            TransitionResult::Rejected(current) => {
                debug!(payment_id = %payment_id, state = %current.state, "Lost completion race");
                return settled_elsewhere(current);
            }
        };

        let user = match self
            .extender
            .extend(
                claimed.user_id,
                claimed.subscription_plan,
                claimed.subscription_duration,
            )
            .await
        {
            Ok(user) => user,
            Err(e) => {
                self.release_claim(&claimed, &e.to_string()).await;
                return Err(LedgerError::SubscriptionExtensionFailed {
                    payment_id: claimed.id,
                    reason: e.to_string(),
                });
            }
        };

        let change = StateChange {
            to: PaymentState::Completed,
            completed_at: Some(Utc::now()),
            failure_reason: None,
            metadata_patch: patch,
        };
        let payment = match self.transition(payment_id, PaymentState::Completing, change).await? {
            TransitionResult::Applied(payment) => payment,
            TransitionResult::Rejected(current) => {
                warn!(
                    alert = true,
                    payment_id = %payment_id,
                    state = %current.state,
                    "Completion claim was released before it settled; subscription already extended"
                );
                return settled_elsewhere(current);
            }
        };

        info!(
            payment_id = %payment.id,
            user_id = %payment.user_id,
            provider = %payment.provider,
            "Payment completed"
        );

        if let Err(e) = self.notifier.send_payment_receipt(&payment, &user).await {
            warn!(payment_id = %payment.id, error = %e, "Payment receipt not sent");
        }
        if let Err(e) = self.notifier.send_subscription_email(&user).await {
            warn!(payment_id = %payment.id, error = %e, "Subscription email not sent");
        }

        Ok(LedgerUpdate::new(payment, Disposition::Applied))
    }

    /// Hands a claimed payment back to `Pending` after the entitlement could
    /// not be granted, so the next provider event or status check retries it.
    async fn release_claim(&self, payment: &Payment, reason: &str) {
        error!(
            alert = true,
            payment_id = %payment.id,
            user_id = %payment.user_id,
            provider = %payment.provider,
            external_ref = %payment.external_ref,
            error = %reason,
            "Subscription extension failed after payment capture"
        );

        let change = StateChange {
            to: PaymentState::Pending,
            completed_at: None,
            failure_reason: None,
            metadata_patch: json!({
                "subscription_extension_error": reason,
                "subscription_extension_failed_at": Utc::now(),
            }),
        };
        match self.store.transition(payment.id, PaymentState::Completing, change).await {
            Ok(Some(TransitionResult::Applied(_))) => {
                warn!(payment_id = %payment.id, "Payment returned to pending for retry");
            }
            Ok(Some(TransitionResult::Rejected(current))) => {
                error!(
                    alert = true,
                    payment_id = %payment.id,
                    state = %current.state,
                    "Could not return payment to pending; manual review required"
                );
            }
            Ok(None) => {
                error!(
                    alert = true,
                    payment_id = %payment.id,
                    "Payment vanished while releasing its completion claim; manual review required"
                );
            }
            Err(e) => {
                error!(
                    alert = true,
                    payment_id = %payment.id,
                    error = %e,
                    "Could not return payment to pending; manual review required"
                );
            }
        }
    }

    /// Passes through anything but a completion claim. A live claim is
    /// `CompletionInProgress`; one idle past `COMPLETION_CLAIM_TTL_SECS` was
    /// abandoned by its worker and goes back to `Pending`.
    async fn settle_claim(&self, payment: Payment) -> LedgerResult<Payment> {
        if payment.state != PaymentState::Completing {
            return Ok(payment);
        }
        let held_for = Utc::now() - payment.updated_at;
        if held_for < Duration::seconds(COMPLETION_CLAIM_TTL_SECS) {
            return Err(LedgerError::CompletionInProgress(payment.id));
        }

        warn!(
            alert = true,
            payment_id = %payment.id,
            held_for_secs = held_for.num_seconds(),
            "Releasing abandoned completion claim"
        );
        let change = StateChange {
            to: PaymentState::Pending,
            completed_at: None,
            failure_reason: None,
            metadata_patch: json!({ "completion_claim_released_at": Utc::now() }),
        };
        match self.transition(payment.id, PaymentState::Completing, change).await? {
            TransitionResult::Applied(released) => Ok(released),
            TransitionResult::Rejected(current) if current.state == PaymentState::Completing => {
                Err(LedgerError::CompletionInProgress(current.id))
            }
            TransitionResult::Rejected(current) => Ok(current),
        }
    }

    async fn fail(
        &self,
        payment_id: Uuid,
        reason: String,
        patch: serde_json::Value,
    ) -> LedgerResult<LedgerUpdate> {
        let change = StateChange {
            to: PaymentState::Failed,
            completed_at: None,
            failure_reason: Some(reason.clone()),
            metadata_patch: patch,
        };
        match self.transition(payment_id, PaymentState::Pending, change).await? {
            TransitionResult::Applied(payment) => {
                info!(payment_id = %payment.id, reason = %reason, "Payment failed");
                Ok(LedgerUpdate::new(payment, Disposition::Applied))
            }
            TransitionResult::Rejected(current) => settled_elsewhere(current),
        }
    }

    /// Fails a payment nobody confirmed within the pending window.
    pub async fn expire(&self, payment_id: Uuid) -> LedgerResult<LedgerUpdate> {
        let payment = self.settle_claim(self.find_by_id(payment_id).await?).await?;
        if payment.state.is_terminal() {
            return Ok(LedgerUpdate::new(payment, Disposition::StaleTerminalState));
        }
        self.fail(
            payment_id,
            EXPIRED_REASON.to_string(),
            json!({ "expired_at": Utc::now() }),
        )
        .await
    }

    /// Administrative `Completed -> Refunded`. The completion time moves into
    /// metadata so `completed_at` stays reserved for completed payments.
    pub async fn refund(&self, payment_id: Uuid, reason: &str) -> LedgerResult<Payment> {
        let payment = self.find_by_id(payment_id).await?;
        if payment.state != PaymentState::Completed {
            return Err(LedgerError::InvalidTransition {
                payment_id,
                from: payment.state,
                to: PaymentState::Refunded,
            });
        }

        let change = StateChange {
            to: PaymentState::Refunded,
            completed_at: None,
            failure_reason: None,
            metadata_patch: json!({
                "refund_reason": reason,
                "refunded_at": Utc::now(),
                "completed_at": payment.completed_at,
            }),
        };
        match self.transition(payment_id, PaymentState::Completed, change).await? {
            TransitionResult::Applied(refunded) => {
                info!(payment_id = %payment_id, reason = %reason, "Payment refunded");
                Ok(refunded)
            }
            TransitionResult::Rejected(current) => Err(LedgerError::InvalidTransition {
                payment_id,
                from: current.state,
                to: PaymentState::Refunded,
            }),
        }
    }

    async fn transition(
        &self,
        payment_id: Uuid,
        expected: PaymentState,
        change: StateChange,
    ) -> LedgerResult<TransitionResult> {
        self.store
            .transition(payment_id, expected, change)
            .await?
            .ok_or_else(|| LedgerError::PaymentNotFound(payment_id.to_string()))
    }
}

/// Outcome for a caller whose write found the payment already moved on. A
/// payment that is still in flight must be retried, not reported as settled.
fn settled_elsewhere(current: Payment) -> LedgerResult<LedgerUpdate> {
    if current.state.is_terminal() {
        Ok(LedgerUpdate::new(current, Disposition::StaleTerminalState))
    } else {
        Err(LedgerError::CompletionInProgress(current.id))
    }
}

/// The provider's amount when it disagrees with the quoted one.
fn amount_mismatch(payment: &Payment, payload: &ProviderPayload) -> Option<String> {
    match payload {
        ProviderPayload::Stripe(details) => {
            let reported = details.reported_amount?;
            let quoted = payment.money().to_minor_units().ok()?;
            (reported != quoted).then(|| reported.to_string())
        }
        ProviderPayload::Pesapal(details) => {
            let reported = details.reported_amount?;
            let quoted = payment.money().to_f64()?;
            ((reported - quoted).abs() > 0.005).then(|| reported.to_string())
        }
        ProviderPayload::AirtelMoney(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::{InMemoryPaymentStore, InMemoryUserStore};
    use crate::database::user_repository::{UserAccount, UserStore};
    use crate::payments::types::{
        Currency, Money, PesapalDetails, SubscriptionDuration, SubscriptionPlan,
    };
    use crate::services::notification::LogNotifier;
    use bigdecimal::BigDecimal;

    struct Fixture {
        ledger: PaymentLedger,
        payments: Arc<InMemoryPaymentStore>,
        users: Arc<InMemoryUserStore>,
        user_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let payments = Arc::new(InMemoryPaymentStore::new());
        let users = Arc::new(InMemoryUserStore::new());
        let user_id = Uuid::new_v4();
        users.insert(UserAccount::new(user_id, "viewer@example.com")).await;
        let ledger = PaymentLedger::new(
            payments.clone(),
            SubscriptionExtender::new(users.clone()),
            Arc::new(LogNotifier::new()),
        );
        Fixture {
            ledger,
            payments,
            users,
            user_id,
        }
    }

    async fn claim(store: &InMemoryPaymentStore, payment_id: Uuid) {
        let change = StateChange {
            to: PaymentState::Completing,
            completed_at: None,
            failure_reason: None,
            metadata_patch: json!({}),
        };
        let claimed = store
            .transition(payment_id, PaymentState::Pending, change)
            .await
            .unwrap();
        assert!(matches!(claimed, Some(TransitionResult::Applied(_))));
    }

    /// Completes the payment between the ledger's read and its metadata merge.
    struct CompletesBeforeMerge(InMemoryPaymentStore);

    #[async_trait::async_trait]
    impl PaymentStore for CompletesBeforeMerge {
        async fn insert(&self, payment: NewPayment) -> Result<Payment, DatabaseError> {
            self.0.insert(payment).await
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError> {
            self.0.find_by_id(id).await
        }

        async fn find_by_reference(
            &self,
            provider: ProviderName,
            external_ref: &str,
        ) -> Result<Option<Payment>, DatabaseError> {
            self.0.find_by_reference(provider, external_ref).await
        }

        async fn find_by_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<Payment>, DatabaseError> {
            self.0.find_by_user(user_id, limit).await
        }

        async fn find_pending_older_than(
            &self,
            cutoff: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<Payment>, DatabaseError> {
            self.0.find_pending_older_than(cutoff, limit).await
        }

        async fn transition(
            &self,
            id: Uuid,
            expected: PaymentState,
            change: StateChange,
        ) -> Result<Option<TransitionResult>, DatabaseError> {
            self.0.transition(id, expected, change).await
        }

        async fn merge_metadata(
            &self,
            id: Uuid,
            patch: serde_json::Value,
        ) -> Result<Option<Payment>, DatabaseError> {
            let change = StateChange {
                to: PaymentState::Completed,
                completed_at: Some(Utc::now()),
                failure_reason: None,
                metadata_patch: json!({ "last_provider_status": "COMPLETED" }),
            };
            self.0.transition(id, PaymentState::Pending, change).await?;
            self.0.merge_metadata(id, patch).await
        }
    }

    fn new_payment(user_id: Uuid, tracking_id: &str) -> NewPayment {
        NewPayment {
            user_id,
            provider: ProviderName::Pesapal,
            external_ref: tracking_id.to_string(),
            merchant_reference: format!("PSP-1-{}", tracking_id),
            amount: Money::new(BigDecimal::from(30000), Currency::Ugx),
            subscription_plan: SubscriptionPlan::Premium,
            subscription_duration: SubscriptionDuration::Monthly,
            provider_metadata: json!({}),
        }
    }

    fn event(tracking_id: &str, outcome: CanonicalOutcome, amount: Option<f64>) -> ProviderStatusEvent {
        ProviderStatusEvent {
            external_ref: tracking_id.to_string(),
            raw_status: format!("{:?}", outcome),
            outcome,
            payload: ProviderPayload::Pesapal(PesapalDetails {
                order_tracking_id: tracking_id.to_string(),
                merchant_reference: None,
                confirmation_code: Some("CONF-1".to_string()),
                payment_method: Some("MTN".to_string()),
                status_code: None,
                status_description: Some("declined".to_string()),
                reported_amount: amount,
                reported_currency: Some("UGX".to_string()),
            }),
        }
    }

    #[tokio::test]
    async fn success_completes_and_extends_subscription() {
        let f = fixture().await;
        f.ledger.create(new_payment(f.user_id, "trk-1")).await.unwrap();

        let update = f
            .ledger
            .apply_outcome(&event("trk-1", CanonicalOutcome::Succeeded, Some(1.0)))
            .await
            .unwrap();

        assert_eq!(update.disposition, Disposition::Applied);
        assert_eq!(update.payment.state, PaymentState::Completed);
        assert!(update.payment.completed_at.is_some());
        assert_eq!(update.payment.amount, BigDecimal::from(30000));
        assert_eq!(update.payment.provider_metadata["confirmation_code"], "CONF-1");

        let user = f.users.find_by_id(f.user_id).await.unwrap().unwrap();
        assert_eq!(user.subscription_plan, Some(SubscriptionPlan::Premium));
    }

    #[tokio::test]
    async fn pending_outcome_only_merges_metadata() {
        let f = fixture().await;
        f.ledger.create(new_payment(f.user_id, "trk-2")).await.unwrap();

        let update = f
            .ledger
            .apply_outcome(&event("trk-2", CanonicalOutcome::Pending, None))
            .await
            .unwrap();
        assert_eq!(update.disposition, Disposition::MetadataMerged);
        assert_eq!(update.payment.state, PaymentState::Pending);
        assert_eq!(update.payment.provider_metadata["payment_method"], "MTN");
    }

    #[tokio::test]
    async fn failure_records_reason_and_is_terminal() {
        let f = fixture().await;
        f.ledger.create(new_payment(f.user_id, "trk-3")).await.unwrap();

        let failed = f
            .ledger
            .apply_outcome(&event("trk-3", CanonicalOutcome::Failed, None))
            .await
            .unwrap();
        assert_eq!(failed.payment.state, PaymentState::Failed);
        assert_eq!(failed.payment.failure_reason.as_deref(), Some("declined"));
        assert!(failed.payment.completed_at.is_none());

        let late = f
            .ledger
            .apply_outcome(&event("trk-3", CanonicalOutcome::Succeeded, None))
            .await
            .unwrap();
        assert_eq!(late.disposition, Disposition::StaleTerminalState);
        assert_eq!(late.payment.state, PaymentState::Failed);
    }

    #[tokio::test]
    async fn unknown_reference_is_not_found() {
        let f = fixture().await;
        let err = f
            .ledger
            .apply_outcome(&event("nope", CanonicalOutcome::Succeeded, None))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::PaymentNotFound(_)));
    }

    #[tokio::test]
    async fn refund_requires_completed_payment() {
        let f = fixture().await;
        let payment = f.ledger.create(new_payment(f.user_id, "trk-4")).await.unwrap();

        let err = f.ledger.refund(payment.id, "chargeback").await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        f.ledger
            .apply_outcome(&event("trk-4", CanonicalOutcome::Succeeded, None))
            .await
            .unwrap();
        let refunded = f.ledger.refund(payment.id, "chargeback").await.unwrap();
        assert_eq!(refunded.state, PaymentState::Refunded);
        assert!(refunded.completed_at.is_none());
        assert_eq!(refunded.provider_metadata["refund_reason"], "chargeback");
        assert!(!refunded.provider_metadata["completed_at"].is_null());
    }

    #[tokio::test]
    async fn expire_fails_pending_payment_once() {
        let f = fixture().await;
        let payment = f.ledger.create(new_payment(f.user_id, "trk-5")).await.unwrap();

        let expired = f.ledger.expire(payment.id).await.unwrap();
        assert_eq!(expired.disposition, Disposition::Applied);
        assert_eq!(expired.payment.failure_reason.as_deref(), Some(EXPIRED_REASON));

        let again = f.ledger.expire(payment.id).await.unwrap();
        assert_eq!(again.disposition, Disposition::StaleTerminalState);
    }

    #[tokio::test]
    async fn live_completion_claim_blocks_other_writers() {
        let f = fixture().await;
        let payment = f.ledger.create(new_payment(f.user_id, "trk-6")).await.unwrap();
        claim(&f.payments, payment.id).await;

        let err = f
            .ledger
            .apply_outcome(&event("trk-6", CanonicalOutcome::Succeeded, None))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::CompletionInProgress(id) if id == payment.id));

        let err = f.ledger.expire(payment.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::CompletionInProgress(_)));

        let user = f.users.find_by_id(f.user_id).await.unwrap().unwrap();
        assert!(user.subscription_plan.is_none());
        let stored = f.ledger.find_by_id(payment.id).await.unwrap();
        assert_eq!(stored.state, PaymentState::Completing);
        assert!(stored.completed_at.is_none());
    }

    #[tokio::test]
    async fn abandoned_completion_claim_is_released_and_retried() {
        let f = fixture().await;
        let payment = f.ledger.create(new_payment(f.user_id, "trk-7")).await.unwrap();
        claim(&f.payments, payment.id).await;
        f.payments
            .touch(
                payment.id,
                Utc::now() - Duration::seconds(COMPLETION_CLAIM_TTL_SECS + 60),
            )
            .await;

        let update = f
            .ledger
            .apply_outcome(&event("trk-7", CanonicalOutcome::Succeeded, None))
            .await
            .unwrap();
        assert_eq!(update.disposition, Disposition::Applied);
        assert_eq!(update.payment.state, PaymentState::Completed);
        assert!(!update.payment.provider_metadata["completion_claim_released_at"].is_null());

        let user = f.users.find_by_id(f.user_id).await.unwrap().unwrap();
        assert_eq!(user.subscription_plan, Some(SubscriptionPlan::Premium));
    }

    #[tokio::test]
    async fn pending_outcome_racing_completion_keeps_final_metadata() {
        let users = Arc::new(InMemoryUserStore::new());
        let user_id = Uuid::new_v4();
        users.insert(UserAccount::new(user_id, "viewer@example.com")).await;
        let ledger = PaymentLedger::new(
            Arc::new(CompletesBeforeMerge(InMemoryPaymentStore::new())),
            SubscriptionExtender::new(users),
            Arc::new(LogNotifier::new()),
        );
        let payment = ledger.create(new_payment(user_id, "trk-8")).await.unwrap();

        let update = ledger
            .apply_outcome(&event("trk-8", CanonicalOutcome::Pending, None))
            .await
            .unwrap();
        assert_eq!(update.disposition, Disposition::StaleTerminalState);
        assert_eq!(update.payment.state, PaymentState::Completed);

        let stored = ledger.find_by_id(payment.id).await.unwrap();
        assert_eq!(stored.provider_metadata["last_provider_status"], "COMPLETED");
        assert!(stored.provider_metadata.get("payment_method").is_none());
    }

    #[test]
    fn amount_mismatch_compares_in_the_right_units() {
        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            provider: ProviderName::Pesapal,
            external_ref: "trk".to_string(),
            merchant_reference: "PSP-1".to_string(),
            amount: BigDecimal::from(30000),
            currency: Currency::Ugx,
            state: PaymentState::Pending,
            subscription_plan: SubscriptionPlan::Premium,
            subscription_duration: SubscriptionDuration::Monthly,
            provider_metadata: json!({}),
            failure_reason: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        assert!(amount_mismatch(&payment, &event("trk", CanonicalOutcome::Succeeded, Some(30000.0)).payload).is_none());
        assert_eq!(
            amount_mismatch(&payment, &event("trk", CanonicalOutcome::Succeeded, Some(1.0)).payload),
            Some("1".to_string())
        );
    }
}
