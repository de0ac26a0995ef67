//! Process-local stores for tests and `SKIP_EXTERNALS` runs.

use crate::database::error::{DatabaseError, DatabaseErrorKind};
use crate::database::payment_repository::{
    merge_json, NewPayment, Payment, PaymentState, PaymentStore, StateChange, TransitionResult,
};
use crate::database::user_repository::{SubscriptionUpdate, UserAccount, UserStore};
use crate::payments::types::ProviderName;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Every mutation takes the write lock, so the state comparison in
/// `transition` and the write happen under one critical section.
#[derive(Default)]
pub struct InMemoryPaymentStore {
    payments: RwLock<HashMap<Uuid, Payment>>,
}

impl InMemoryPaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.payments.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.payments.read().await.is_empty()
    }

    /// Rewrites `created_at`; lets expiry tests age a payment.
    pub async fn backdate(&self, id: Uuid, created_at: DateTime<Utc>) {
        if let Some(payment) = self.payments.write().await.get_mut(&id) {
            payment.created_at = created_at;
        }
    }

    /// Rewrites `updated_at`; lets tests age a completion claim.
    pub async fn touch(&self, id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(payment) = self.payments.write().await.get_mut(&id) {
            payment.updated_at = updated_at;
        }
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    async fn insert(&self, new: NewPayment) -> Result<Payment, DatabaseError> {
        let mut payments = self.payments.write().await;
        let collides = payments.values().any(|p| {
            (p.provider == new.provider && p.external_ref == new.external_ref)
                || p.merchant_reference == new.merchant_reference
        });
        if collides {
            return Err(DatabaseError::new(DatabaseErrorKind::UniqueViolation {
                constraint: "payments_provider_external_ref_key".to_string(),
            }));
        }

        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            provider: new.provider,
            external_ref: new.external_ref,
            merchant_reference: new.merchant_reference,
            amount: new.amount.amount,
            currency: new.amount.currency,
            state: PaymentState::Pending,
            subscription_plan: new.subscription_plan,
            subscription_duration: new.subscription_duration,
            provider_metadata: new.provider_metadata,
            failure_reason: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        };
        payments.insert(payment.id, payment.clone());
        Ok(payment)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Payment>, DatabaseError> {
        Ok(self.payments.read().await.get(&id).cloned())
    }

    async fn find_by_reference(
        &self,
        provider: ProviderName,
        external_ref: &str,
    ) -> Result<Option<Payment>, DatabaseError> {
        Ok(self
            .payments
            .read()
            .await
            .values()
            .find(|p| p.provider == provider && p.external_ref == external_ref)
            .cloned())
    }

    async fn find_by_user(&self, user_id: Uuid, limit: i64) -> Result<Vec<Payment>, DatabaseError> {
        let mut found: Vec<Payment> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn find_pending_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Payment>, DatabaseError> {
        let mut found: Vec<Payment> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| !p.state.is_terminal() && p.created_at < cutoff)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        found.truncate(limit.max(0) as usize);
        Ok(found)
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: PaymentState,
        change: StateChange,
    ) -> Result<Option<TransitionResult>, DatabaseError> {
        let mut payments = self.payments.write().await;
        let payment = match payments.get_mut(&id) {
            Some(payment) => payment,
            None => return Ok(None),
        };
        if payment.state != expected {
            return Ok(Some(TransitionResult::Rejected(payment.clone())));
        }

        payment.state = change.to;
        payment.completed_at = change.completed_at;
        payment.failure_reason = change.failure_reason;
        payment.provider_metadata = merge_json(&payment.provider_metadata, &change.metadata_patch);
        payment.updated_at = Utc::now();
        Ok(Some(TransitionResult::Applied(payment.clone())))
    }

    async fn merge_metadata(
        &self,
        id: Uuid,
        patch: JsonValue,
    ) -> Result<Option<Payment>, DatabaseError> {
        let mut payments = self.payments.write().await;
        Ok(payments
            .get_mut(&id)
            .filter(|payment| payment.state == PaymentState::Pending)
            .map(|payment| {
                payment.provider_metadata = merge_json(&payment.provider_metadata, &patch);
                payment.updated_at = Utc::now();
                payment.clone()
            }))
    }
}

#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<Uuid, UserAccount>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, user: UserAccount) {
        self.users.write().await.insert(user.id, user);
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, DatabaseError> {
        Ok(self.users.read().await.get(&id).cloned())
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        update: SubscriptionUpdate,
    ) -> Result<Option<UserAccount>, DatabaseError> {
        let mut users = self.users.write().await;
        Ok(users.get_mut(&id).map(|user| {
            user.subscription_plan = Some(update.plan);
            user.subscription_status = update.status;
            user.subscription_end_date = Some(update.end_date);
            user.clone()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::{Currency, Money, SubscriptionDuration, SubscriptionPlan};
    use bigdecimal::BigDecimal;
    use std::sync::Arc;

    fn new_payment(external_ref: &str) -> NewPayment {
        NewPayment {
            user_id: Uuid::new_v4(),
            provider: ProviderName::Pesapal,
            external_ref: external_ref.to_string(),
            merchant_reference: format!("PSP-{}", external_ref),
            amount: Money::new(BigDecimal::from(15000), Currency::Ugx),
            subscription_plan: SubscriptionPlan::Basic,
            subscription_duration: SubscriptionDuration::Monthly,
            provider_metadata: serde_json::json!({}),
        }
    }

    fn complete() -> StateChange {
        StateChange {
            to: PaymentState::Completed,
            completed_at: Some(Utc::now()),
            failure_reason: None,
            metadata_patch: serde_json::json!({"confirmation_code": "X"}),
        }
    }

    #[tokio::test]
    async fn duplicate_reference_is_rejected_without_write() {
        let store = InMemoryPaymentStore::new();
        store.insert(new_payment("track-1")).await.unwrap();
        let err = store.insert(new_payment("track-1")).await.unwrap_err();
        assert!(err.is_unique_violation());
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn transition_only_applies_from_expected_state() {
        let store = InMemoryPaymentStore::new();
        let payment = store.insert(new_payment("track-2")).await.unwrap();

        let first = store
            .transition(payment.id, PaymentState::Pending, complete())
            .await
            .unwrap();
        assert!(matches!(first, Some(TransitionResult::Applied(ref p)) if p.state == PaymentState::Completed));

        let second = store
            .transition(payment.id, PaymentState::Pending, complete())
            .await
            .unwrap();
        match second {
            Some(TransitionResult::Rejected(current)) => {
                assert_eq!(current.state, PaymentState::Completed);
                assert_eq!(current.provider_metadata["confirmation_code"], "X");
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        assert!(store
            .transition(Uuid::new_v4(), PaymentState::Pending, complete())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn concurrent_transitions_apply_once() {
        let store = Arc::new(InMemoryPaymentStore::new());
        let payment = store.insert(new_payment("track-3")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .transition(payment.id, PaymentState::Pending, complete())
                    .await
                    .unwrap()
            }));
        }
        let mut applied = 0;
        for handle in handles {
            if let Some(TransitionResult::Applied(_)) = handle.await.unwrap() {
                applied += 1;
            }
        }
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn metadata_merge_skips_settled_payments() {
        let store = InMemoryPaymentStore::new();
        let payment = store.insert(new_payment("track-4")).await.unwrap();

        let merged = store
            .merge_metadata(payment.id, serde_json::json!({"status": "PENDING"}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(merged.provider_metadata["status"], "PENDING");

        store
            .transition(payment.id, PaymentState::Pending, complete())
            .await
            .unwrap();
        let late = store
            .merge_metadata(payment.id, serde_json::json!({"status": "STALE"}))
            .await
            .unwrap();
        assert!(late.is_none());

        let stored = store.find_by_id(payment.id).await.unwrap().unwrap();
        assert_eq!(stored.provider_metadata["status"], "PENDING");
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let store = InMemoryPaymentStore::new();
        let user_id = Uuid::new_v4();
        let mut ids = Vec::new();
        for i in 0..3 {
            let mut new = new_payment(&format!("hist-{}", i));
            new.user_id = user_id;
            let payment = store.insert(new).await.unwrap();
            store
                .backdate(payment.id, Utc::now() - chrono::Duration::minutes(10 - i))
                .await;
            ids.push(payment.id);
        }
        let history = store.find_by_user(user_id, 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, ids[2]);
        assert_eq!(history[1].id, ids[1]);
    }
}
