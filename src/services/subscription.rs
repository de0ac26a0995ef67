use crate::database::user_repository::{SubscriptionStatus, SubscriptionUpdate, UserAccount, UserStore};
use crate::payments::types::{SubscriptionDuration, SubscriptionPlan};
use chrono::{Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExtensionError {
    #[error("User not found: {0}")]
    UserNotFound(Uuid),
    #[error("User store error: {0}")]
    Store(String),
}

/// Grants the entitlement bought by a completed payment.
pub struct SubscriptionExtender {
    users: Arc<dyn UserStore>,
}

impl SubscriptionExtender {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    /// Activates `plan` until now + 30 days (monthly) or 365 days (yearly).
    pub async fn extend(
        &self,
        user_id: Uuid,
        plan: SubscriptionPlan,
        duration: SubscriptionDuration,
    ) -> Result<UserAccount, ExtensionError> {
        let end_date = Utc::now() + Duration::days(duration.days());
        let user = self
            .users
            .update_subscription(
                user_id,
                SubscriptionUpdate {
                    plan,
                    status: SubscriptionStatus::Active,
                    end_date,
                },
            )
            .await
            .map_err(|e| ExtensionError::Store(e.to_string()))?
            .ok_or(ExtensionError::UserNotFound(user_id))?;

        info!(
            user_id = %user_id,
            plan = plan.as_str(),
            duration = duration.as_str(),
            end_date = %end_date,
            "Subscription extended"
        );
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::InMemoryUserStore;

    #[tokio::test]
    async fn yearly_extension_sets_end_date_a_year_out() {
        let users = Arc::new(InMemoryUserStore::new());
        let user_id = Uuid::new_v4();
        users.insert(UserAccount::new(user_id, "viewer@example.com")).await;

        let extender = SubscriptionExtender::new(users.clone());
        let user = extender
            .extend(user_id, SubscriptionPlan::Premium, SubscriptionDuration::Yearly)
            .await
            .unwrap();

        assert_eq!(user.subscription_plan, Some(SubscriptionPlan::Premium));
        assert_eq!(user.subscription_status, SubscriptionStatus::Active);
        let days = (user.subscription_end_date.unwrap() - Utc::now()).num_days();
        assert!((364..=365).contains(&days));
    }

    #[tokio::test]
    async fn missing_user_is_an_error() {
        let extender = SubscriptionExtender::new(Arc::new(InMemoryUserStore::new()));
        let err = extender
            .extend(Uuid::new_v4(), SubscriptionPlan::Basic, SubscriptionDuration::Monthly)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::UserNotFound(_)));
    }
}
