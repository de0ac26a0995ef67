#![allow(dead_code)]

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamflix_backend::database::error::{DatabaseError, DatabaseErrorKind};
use streamflix_backend::database::memory::{InMemoryPaymentStore, InMemoryUserStore};
use streamflix_backend::database::payment_repository::{Payment, PaymentStore};
use streamflix_backend::database::user_repository::{
    SubscriptionUpdate, UserAccount, UserStore,
};
use streamflix_backend::payments::error::{PaymentError, PaymentResult};
use streamflix_backend::payments::factory::ProviderRegistry;
use streamflix_backend::payments::pricing::PricingTable;
use streamflix_backend::payments::provider::PaymentProvider;
use streamflix_backend::payments::types::{
    CallbackRef, CanonicalOutcome, Currency, HandleKind, PaymentRequest, PesapalDetails,
    ProviderHandle, ProviderName, ProviderPayload, ProviderStatusEvent,
};
use streamflix_backend::services::notification::{NotificationError, Notifier};
use streamflix_backend::services::{
    PaymentLedger, ReconciliationCoordinator, RedirectPages, SubscriptionExtender,
};
use uuid::Uuid;

/// What the scripted provider answers to a status query.
#[derive(Debug, Clone)]
pub enum Scripted {
    Outcome(CanonicalOutcome),
    Unavailable,
}

/// PesaPal-shaped provider whose status answers are set by the test.
pub struct ScriptedProvider {
    answer: Mutex<Scripted>,
    reported_amount: Mutex<Option<f64>>,
    pub status_queries: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(answer: Scripted) -> Self {
        Self {
            answer: Mutex::new(answer),
            reported_amount: Mutex::new(None),
            status_queries: AtomicUsize::new(0),
        }
    }

    pub fn answer(&self, answer: Scripted) {
        *self.answer.lock().unwrap() = answer;
    }

    pub fn report_amount(&self, amount: f64) {
        *self.reported_amount.lock().unwrap() = Some(amount);
    }

    pub fn queries(&self) -> usize {
        self.status_queries.load(Ordering::SeqCst)
    }
}

#[derive(Deserialize)]
struct Ipn {
    #[serde(rename = "OrderTrackingId")]
    order_tracking_id: String,
    #[serde(rename = "OrderMerchantReference")]
    order_merchant_reference: Option<String>,
}

#[async_trait]
impl PaymentProvider for ScriptedProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Pesapal
    }

    fn supported_currencies(&self) -> &'static [Currency] {
        &[Currency::Ugx]
    }

    fn default_currency(&self) -> Currency {
        Currency::Ugx
    }

    async fn initiate(&self, request: PaymentRequest) -> PaymentResult<ProviderHandle> {
        let tracking_id = format!("trk-{}", request.merchant_reference);
        Ok(ProviderHandle {
            external_ref: tracking_id.clone(),
            handle: HandleKind::RedirectUrl(format!(
                "https://pay.example.test/iframe?OrderTrackingId={}",
                tracking_id
            )),
            metadata: serde_json::json!({ "order_tracking_id": tracking_id }),
        })
    }

    async fn query_status(&self, external_ref: &str) -> PaymentResult<ProviderStatusEvent> {
        self.status_queries.fetch_add(1, Ordering::SeqCst);
        let answer = self.answer.lock().unwrap().clone();
        let outcome = match answer {
            Scripted::Outcome(outcome) => outcome,
            Scripted::Unavailable => {
                return Err(PaymentError::unavailable("pesapal", "connection reset"))
            }
        };
        let status_code = match outcome {
            CanonicalOutcome::Succeeded => 1,
            CanonicalOutcome::Failed => 2,
            CanonicalOutcome::Pending => 0,
        };
        Ok(ProviderStatusEvent {
            external_ref: external_ref.to_string(),
            raw_status: status_code.to_string(),
            outcome,
            payload: ProviderPayload::Pesapal(PesapalDetails {
                order_tracking_id: external_ref.to_string(),
                merchant_reference: None,
                confirmation_code: Some("CONF-77".to_string()),
                payment_method: Some("MTN Mobile Money".to_string()),
                status_code: Some(status_code),
                status_description: Some("Declined by subscriber".to_string()),
                reported_amount: *self.reported_amount.lock().unwrap(),
                reported_currency: Some("UGX".to_string()),
            }),
        })
    }

    fn parse_callback(&self, payload: &[u8]) -> PaymentResult<CallbackRef> {
        let ipn: Ipn = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::malformed(e.to_string()))?;
        Ok(CallbackRef {
            tracking_ref: ipn.order_tracking_id,
            merchant_ref: ipn.order_merchant_reference,
            notification_type: Some("IPNCHANGE".to_string()),
        })
    }
}

#[derive(Default)]
pub struct CountingNotifier {
    pub receipts: AtomicUsize,
    pub subscription_emails: AtomicUsize,
}

impl CountingNotifier {
    pub fn receipts(&self) -> usize {
        self.receipts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Notifier for CountingNotifier {
    async fn send_payment_receipt(
        &self,
        _payment: &Payment,
        _user: &UserAccount,
    ) -> Result<(), NotificationError> {
        self.receipts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send_subscription_email(&self, _user: &UserAccount) -> Result<(), NotificationError> {
        self.subscription_emails.fetch_add(1, Ordering::SeqCst);
        Err(NotificationError("smtp relay refused".to_string()))
    }
}

/// Counts subscription writes; can be told to fail them.
#[derive(Default)]
pub struct CountingUserStore {
    inner: InMemoryUserStore,
    pub extensions: AtomicUsize,
    failing: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
}

impl CountingUserStore {
    pub async fn insert(&self, user: UserAccount) {
        self.inner.insert(user).await;
    }

    pub fn extensions(&self) -> usize {
        self.extensions.load(Ordering::SeqCst)
    }

    pub fn fail_updates(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    /// Every subscription update waits this long before answering.
    pub fn slow_updates(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl UserStore for CountingUserStore {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<UserAccount>, DatabaseError> {
        self.inner.find_by_id(id).await
    }

    async fn update_subscription(
        &self,
        id: Uuid,
        update: SubscriptionUpdate,
    ) -> Result<Option<UserAccount>, DatabaseError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.failing.lock().unwrap() {
            return Err(DatabaseError::new(DatabaseErrorKind::Connection {
                message: "users table unavailable".to_string(),
            }));
        }
        let updated = self.inner.update_subscription(id, update).await?;
        if updated.is_some() {
            self.extensions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(updated)
    }
}

pub struct Harness {
    pub coordinator: Arc<ReconciliationCoordinator>,
    pub payments: Arc<InMemoryPaymentStore>,
    pub users: Arc<CountingUserStore>,
    pub notifier: Arc<CountingNotifier>,
    pub user_id: Uuid,
}

impl Harness {
    pub async fn new(providers: Vec<Arc<dyn PaymentProvider>>) -> Self {
        let payments = Arc::new(InMemoryPaymentStore::new());
        let users = Arc::new(CountingUserStore::default());
        let notifier = Arc::new(CountingNotifier::default());
        let user_id = Uuid::new_v4();
        users
            .insert(UserAccount::new(user_id, "viewer@example.com"))
            .await;

        let ledger = Arc::new(PaymentLedger::new(
            payments.clone() as Arc<dyn PaymentStore>,
            SubscriptionExtender::new(users.clone()),
            notifier.clone(),
        ));
        let mut registry = ProviderRegistry::new();
        for provider in providers {
            registry.register(provider);
        }
        let coordinator = Arc::new(ReconciliationCoordinator::new(
            registry,
            ledger,
            PricingTable::default(),
            RedirectPages::default(),
        ));

        Self {
            coordinator,
            payments,
            users,
            notifier,
            user_id,
        }
    }

    pub async fn user(&self) -> UserAccount {
        self.users.find_by_id(self.user_id).await.unwrap().unwrap()
    }
}
