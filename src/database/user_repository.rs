use crate::database::error::DatabaseError;
use crate::payments::types::SubscriptionPlan;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Inactive,
    Active,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Inactive => "inactive",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Expired => "expired",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "inactive" => Ok(SubscriptionStatus::Inactive),
            "active" => Ok(SubscriptionStatus::Active),
            "expired" => Ok(SubscriptionStatus::Expired),
            other => Err(DatabaseError::decode(format!(
                "unknown subscription status: {}",
                other
            ))),
        }
    }
}

/// The subscription-related slice of a platform user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserAccount {
    pub id: Uuid,
    pub email: String,
    pub display_name: Option<String>,
    pub subscription_plan: Option<SubscriptionPlan>,
    pub subscription_status: SubscriptionStatus,
    pub subscription_end_date: Option<DateTime<Utc>>,
}

impl UserAccount {
    pub fn new(id: Uuid, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            display_name: None,
            subscription_plan: None,
            subscription_status: SubscriptionStatus::Inactive,
            subscription_end_date: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub plan: SubscriptionPlan,
    pub status: SubscriptionStatus,
    pub end_date: DateTime<Utc>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, DatabaseError>;

    /// `Ok(None)` when the user does not exist.
    async fn update_subscription(
        &self,
        id: Uuid,
        update: SubscriptionUpdate,
    ) -> Result<Option<UserAccount>, DatabaseError>;
}

#[cfg(feature = "database")]
pub use pg::UserRepository;

#[cfg(feature = "database")]
mod pg {
    use super::*;
    use sqlx::{FromRow, PgPool};

    #[derive(Debug, FromRow)]
    struct UserRow {
        id: Uuid,
        email: String,
        display_name: Option<String>,
        subscription_plan: Option<String>,
        subscription_status: String,
        subscription_end_date: Option<DateTime<Utc>>,
    }

    impl TryFrom<UserRow> for UserAccount {
        type Error = DatabaseError;

        fn try_from(row: UserRow) -> Result<Self, Self::Error> {
            let subscription_plan = row
                .subscription_plan
                .as_deref()
                .map(SubscriptionPlan::from_str)
                .transpose()
                .map_err(|e| DatabaseError::decode(e.to_string()))?;
            Ok(UserAccount {
                id: row.id,
                email: row.email,
                display_name: row.display_name,
                subscription_plan,
                subscription_status: SubscriptionStatus::from_str(&row.subscription_status)?,
                subscription_end_date: row.subscription_end_date,
            })
        }
    }

    pub struct UserRepository {
        pool: PgPool,
    }

    impl UserRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl UserStore for UserRepository {
        async fn find_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, DatabaseError> {
            sqlx::query_as::<_, UserRow>(
                "SELECT id, email, display_name, subscription_plan, subscription_status,
                        subscription_end_date
                 FROM users WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(UserAccount::try_from)
            .transpose()
        }

        async fn update_subscription(
            &self,
            id: Uuid,
            update: SubscriptionUpdate,
        ) -> Result<Option<UserAccount>, DatabaseError> {
            sqlx::query_as::<_, UserRow>(
                "UPDATE users
                 SET subscription_plan = $2,
                     subscription_status = $3,
                     subscription_end_date = $4,
                     updated_at = NOW()
                 WHERE id = $1
                 RETURNING id, email, display_name, subscription_plan, subscription_status,
                           subscription_end_date",
            )
            .bind(id)
            .bind(update.plan.as_str())
            .bind(update.status.as_str())
            .bind(update.end_date)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(UserAccount::try_from)
            .transpose()
        }
    }
}
