use crate::database::error::DatabaseError;
use crate::payments::types::{
    Currency, Money, ProviderName, SubscriptionDuration, SubscriptionPlan,
};
use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    /// Claimed by a worker that is extending the subscription. Never has
    /// `completed_at`; settles to `Completed` or back to `Pending`.
    Completing,
    Completed,
    Failed,
    Refunded,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Pending => "pending",
            PaymentState::Completing => "completing",
            PaymentState::Completed => "completed",
            PaymentState::Failed => "failed",
            PaymentState::Refunded => "refunded",
        }
    }

    /// No provider outcome can move a payment out of these states.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentState::Pending | PaymentState::Completing)
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentState {
    type Err = DatabaseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(PaymentState::Pending),
            "completing" => Ok(PaymentState::Completing),
            "completed" => Ok(PaymentState::Completed),
            "failed" => Ok(PaymentState::Failed),
            "refunded" => Ok(PaymentState::Refunded),
            other => Err(DatabaseError::decode(format!("unknown payment state: {}", other))),
        }
    }
}

/// Payment record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub provider: ProviderName,
    pub external_ref: String,
    pub merchant_reference: String,
    pub amount: BigDecimal,
    pub currency: Currency,
    pub state: PaymentState,
    pub subscription_plan: SubscriptionPlan,
    pub subscription_duration: SubscriptionDuration,
    pub provider_metadata: JsonValue,
    pub failure_reason: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn money(&self) -> Money {
        Money::new(self.amount.clone(), self.currency)
    }
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub user_id: Uuid,
    pub provider: ProviderName,
    pub external_ref: String,
    pub merchant_reference: String,
    pub amount: Money,
    pub subscription_plan: SubscriptionPlan,
    pub subscription_duration: SubscriptionDuration,
    pub provider_metadata: JsonValue,
}

/// Fields written by a state transition. `completed_at` and `failure_reason`
/// are written as given, including `None`.
#[derive(Debug, Clone)]
pub struct StateChange {
    pub to: PaymentState,
    pub completed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub metadata_patch: JsonValue,
}

#[derive(Debug, Clone)]
pub enum TransitionResult {
    /// The stored state matched and the change was written.
    Applied(Payment),
    /// The stored state differed; carries the payment as currently stored.
    Rejected(Payment),
}

/// Payment persistence. `transition` is the only way to change `state` and
/// must be atomic: compare the stored state with `expected` and write in one
/// step.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Fails with a unique violation when the (provider, external_ref) pair or
    /// the merchant reference already exists.
    async fn insert(&self, payment: NewPayment) -> Result<Payment, DatabaseError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError>;

    async fn find_by_reference(
        &self,
        provider: ProviderName,
        external_ref: &str,
    ) -> Result<Option<Payment>, DatabaseError>;

    /// Newest first.
    async fn find_by_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<Payment>, DatabaseError>;

    /// Pending payments and completion claims created before `cutoff`,
    /// oldest first.
    async fn find_pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>, DatabaseError>;

    /// `Ok(None)` when no payment has this id.
    async fn transition(
        &self,
        id: Uuid,
        expected: PaymentState,
        change: StateChange,
    ) -> Result<Option<TransitionResult>, DatabaseError>;

    /// Shallow-merges `patch` into `provider_metadata` of a pending payment.
    /// `Ok(None)` when no payment has this id or it is no longer pending.
    async fn merge_metadata(
        &self,
        id: Uuid,
        patch: JsonValue,
    ) -> Result<Option<Payment>, DatabaseError>;
}

/// Top-level key merge, matching Postgres `jsonb || jsonb`.
pub fn merge_json(base: &JsonValue, patch: &JsonValue) -> JsonValue {
    match (base, patch) {
        (JsonValue::Object(base), JsonValue::Object(patch)) => {
            let mut merged = base.clone();
            for (k, v) in patch {
                merged.insert(k.clone(), v.clone());
            }
            JsonValue::Object(merged)
        }
        (_, JsonValue::Object(_)) => patch.clone(),
        (base, _) => base.clone(),
    }
}

#[cfg(feature = "database")]
pub use pg::PaymentRepository;

#[cfg(feature = "database")]
mod pg {
    use super::*;
    use sqlx::{FromRow, PgPool};

    const PAYMENT_COLUMNS: &str = "id, user_id, provider, external_ref, merchant_reference, \
         amount, currency, state, subscription_plan, subscription_duration, provider_metadata, \
         failure_reason, completed_at, created_at, updated_at";

    #[derive(Debug, FromRow)]
    struct PaymentRow {
        id: Uuid,
        user_id: Uuid,
        provider: String,
        external_ref: String,
        merchant_reference: String,
        amount: BigDecimal,
        currency: String,
        state: String,
        subscription_plan: String,
        subscription_duration: String,
        provider_metadata: JsonValue,
        failure_reason: Option<String>,
        completed_at: Option<DateTime<Utc>>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    }

    impl TryFrom<PaymentRow> for Payment {
        type Error = DatabaseError;

        fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
            let decode = |e: crate::payments::error::PaymentError| {
                DatabaseError::decode(e.to_string())
            };
            Ok(Payment {
                id: row.id,
                user_id: row.user_id,
                provider: ProviderName::from_str(&row.provider).map_err(decode)?,
                external_ref: row.external_ref,
                merchant_reference: row.merchant_reference,
                amount: row.amount,
                currency: Currency::from_str(&row.currency).map_err(decode)?,
                state: PaymentState::from_str(&row.state)?,
                subscription_plan: SubscriptionPlan::from_str(&row.subscription_plan)
                    .map_err(decode)?,
                subscription_duration: SubscriptionDuration::from_str(
                    &row.subscription_duration,
                )
                .map_err(decode)?,
                provider_metadata: row.provider_metadata,
                failure_reason: row.failure_reason,
                completed_at: row.completed_at,
                created_at: row.created_at,
                updated_at: row.updated_at,
            })
        }
    }

    // `jsonb || 'null'` yields an array, so non-objects are dropped.
    fn object_or_empty(patch: JsonValue) -> JsonValue {
        if patch.is_object() {
            patch
        } else {
            JsonValue::Object(Default::default())
        }
    }

    fn into_payments(rows: Vec<PaymentRow>) -> Result<Vec<Payment>, DatabaseError> {
        rows.into_iter().map(Payment::try_from).collect()
    }

    /// Postgres-backed payment store
    pub struct PaymentRepository {
        pool: PgPool,
    }

    impl PaymentRepository {
        pub fn new(pool: PgPool) -> Self {
            Self { pool }
        }
    }

    #[async_trait]
    impl PaymentStore for PaymentRepository {
        async fn insert(&self, payment: NewPayment) -> Result<Payment, DatabaseError> {
            let row = sqlx::query_as::<_, PaymentRow>(&format!(
                "INSERT INTO payments
                 (id, user_id, provider, external_ref, merchant_reference, amount, currency,
                  state, subscription_plan, subscription_duration, provider_metadata)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', $8, $9, $10)
                 RETURNING {}",
                PAYMENT_COLUMNS
            ))
            .bind(Uuid::new_v4())
            .bind(payment.user_id)
            .bind(payment.provider.as_str())
            .bind(&payment.external_ref)
            .bind(&payment.merchant_reference)
            .bind(&payment.amount.amount)
            .bind(payment.amount.currency.as_str())
            .bind(payment.subscription_plan.as_str())
            .bind(payment.subscription_duration.as_str())
            .bind(&payment.provider_metadata)
            .fetch_one(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            Payment::try_from(row)
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError> {
            sqlx::query_as::<_, PaymentRow>(&format!(
                "SELECT {} FROM payments WHERE id = $1",
                PAYMENT_COLUMNS
            ))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Payment::try_from)
            .transpose()
        }

        async fn find_by_reference(
            &self,
            provider: ProviderName,
            external_ref: &str,
        ) -> Result<Option<Payment>, DatabaseError> {
            sqlx::query_as::<_, PaymentRow>(&format!(
                "SELECT {} FROM payments WHERE provider = $1 AND external_ref = $2",
                PAYMENT_COLUMNS
            ))
            .bind(provider.as_str())
            .bind(external_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Payment::try_from)
            .transpose()
        }

        async fn find_by_user(
            &self,
            user_id: Uuid,
            limit: i64,
        ) -> Result<Vec<Payment>, DatabaseError> {
            let rows = sqlx::query_as::<_, PaymentRow>(&format!(
                "SELECT {} FROM payments WHERE user_id = $1
                 ORDER BY created_at DESC
                 LIMIT $2",
                PAYMENT_COLUMNS
            ))
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            into_payments(rows)
        }

        async fn find_pending_older_than(
            &self,
            cutoff: DateTime<Utc>,
            limit: i64,
        ) -> Result<Vec<Payment>, DatabaseError> {
            let rows = sqlx::query_as::<_, PaymentRow>(&format!(
                "SELECT {} FROM payments
                 WHERE state IN ('pending', 'completing') AND created_at < $1
                 ORDER BY created_at ASC
                 LIMIT $2",
                PAYMENT_COLUMNS
            ))
            .bind(cutoff)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;
            into_payments(rows)
        }

        async fn transition(
            &self,
            id: Uuid,
            expected: PaymentState,
            change: StateChange,
        ) -> Result<Option<TransitionResult>, DatabaseError> {
            // Single-statement compare-and-swap; the row lock taken by UPDATE
            // serializes concurrent writers.
            let updated = sqlx::query_as::<_, PaymentRow>(&format!(
                "UPDATE payments
                 SET state = $3,
                     completed_at = $4,
                     failure_reason = $5,
                     provider_metadata = provider_metadata || $6::jsonb,
                     updated_at = NOW()
                 WHERE id = $1 AND state = $2
                 RETURNING {}",
                PAYMENT_COLUMNS
            ))
            .bind(id)
            .bind(expected.as_str())
            .bind(change.to.as_str())
            .bind(change.completed_at)
            .bind(change.failure_reason)
            .bind(object_or_empty(change.metadata_patch))
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?;

            match updated {
                Some(row) => Ok(Some(TransitionResult::Applied(Payment::try_from(row)?))),
                None => Ok(self.find_by_id(id).await?.map(TransitionResult::Rejected)),
            }
        }

        async fn merge_metadata(
            &self,
            id: Uuid,
            patch: JsonValue,
        ) -> Result<Option<Payment>, DatabaseError> {
            sqlx::query_as::<_, PaymentRow>(&format!(
                "UPDATE payments
                 SET provider_metadata = provider_metadata || $2::jsonb, updated_at = NOW()
                 WHERE id = $1 AND state = 'pending'
                 RETURNING {}",
                PAYMENT_COLUMNS
            ))
            .bind(id)
            .bind(object_or_empty(patch))
            .fetch_optional(&self.pool)
            .await
            .map_err(DatabaseError::from_sqlx)?
            .map(Payment::try_from)
            .transpose()
        }
    }

}
