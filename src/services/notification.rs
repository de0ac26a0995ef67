use crate::database::payment_repository::Payment;
use crate::database::user_repository::UserAccount;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NotificationType {
    PaymentReceipt,
    SubscriptionActivated,
}

#[derive(Debug, Error)]
#[error("Notification delivery failed: {0}")]
pub struct NotificationError(pub String);

/// Outbound user email. Callers treat every failure as non-fatal.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_payment_receipt(
        &self,
        payment: &Payment,
        user: &UserAccount,
    ) -> Result<(), NotificationError>;

    async fn send_subscription_email(&self, user: &UserAccount) -> Result<(), NotificationError>;
}

/// Writes notifications to the log instead of sending them.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_payment_receipt(
        &self,
        payment: &Payment,
        user: &UserAccount,
    ) -> Result<(), NotificationError> {
        info!(
            notification = ?NotificationType::PaymentReceipt,
            payment_id = %payment.id,
            email = %user.email,
            amount = %payment.amount,
            currency = %payment.currency,
            provider = %payment.provider,
            "🔔 NOTIFICATION: Payment Receipt - {} {} subscription",
            payment.subscription_plan.as_str(),
            payment.subscription_duration.as_str()
        );
        Ok(())
    }

    async fn send_subscription_email(&self, user: &UserAccount) -> Result<(), NotificationError> {
        info!(
            notification = ?NotificationType::SubscriptionActivated,
            user_id = %user.id,
            email = %user.email,
            plan = ?user.subscription_plan,
            end_date = ?user.subscription_end_date,
            "🔔 NOTIFICATION: Subscription Activated"
        );
        Ok(())
    }
}
