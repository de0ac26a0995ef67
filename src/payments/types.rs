use crate::payments::error::PaymentError;
use bigdecimal::{BigDecimal, ToPrimitive};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderName {
    Stripe,
    Pesapal,
    AirtelMoney,
}

impl ProviderName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderName::Stripe => "stripe",
            ProviderName::Pesapal => "pesapal",
            ProviderName::AirtelMoney => "airtel_money",
        }
    }

    /// Prefix used for self-generated merchant references.
    pub fn reference_prefix(&self) -> &'static str {
        match self {
            ProviderName::Stripe => "STR",
            ProviderName::Pesapal => "PSP",
            ProviderName::AirtelMoney => "ATL",
        }
    }
}

impl std::fmt::Display for ProviderName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ProviderName {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "stripe" => Ok(ProviderName::Stripe),
            "pesapal" => Ok(ProviderName::Pesapal),
            "airtel" | "airtel_money" | "airtel-money" => Ok(ProviderName::AirtelMoney),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported provider: {}", value),
                field: Some("provider".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Ugx,
    Usd,
    Eur,
    Gbp,
}

impl Currency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Currency::Ugx => "UGX",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
        }
    }

    /// Number of minor units per major unit as card processors count them.
    /// UGX is a zero-decimal currency.
    pub fn minor_unit_factor(&self) -> i64 {
        match self {
            Currency::Ugx => 1,
            Currency::Usd | Currency::Eur | Currency::Gbp => 100,
        }
    }
}

impl std::fmt::Display for Currency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Currency {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_uppercase().as_str() {
            "UGX" => Ok(Currency::Ugx),
            "USD" => Ok(Currency::Usd),
            "EUR" => Ok(Currency::Eur),
            "GBP" => Ok(Currency::Gbp),
            _ => Err(PaymentError::ValidationError {
                message: format!("unsupported currency: {}", value),
                field: Some("currency".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPlan {
    Basic,
    Premium,
}

impl SubscriptionPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionPlan::Basic => "basic",
            SubscriptionPlan::Premium => "premium",
        }
    }
}

impl FromStr for SubscriptionPlan {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "basic" => Ok(SubscriptionPlan::Basic),
            "premium" => Ok(SubscriptionPlan::Premium),
            _ => Err(PaymentError::ValidationError {
                message: format!("unknown subscription plan: {}", value),
                field: Some("subscription_plan".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionDuration {
    Monthly,
    Yearly,
}

impl SubscriptionDuration {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionDuration::Monthly => "monthly",
            SubscriptionDuration::Yearly => "yearly",
        }
    }

    pub fn days(&self) -> i64 {
        match self {
            SubscriptionDuration::Monthly => 30,
            SubscriptionDuration::Yearly => 365,
        }
    }
}

impl FromStr for SubscriptionDuration {
    type Err = PaymentError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "monthly" => Ok(SubscriptionDuration::Monthly),
            "yearly" => Ok(SubscriptionDuration::Yearly),
            _ => Err(PaymentError::ValidationError {
                message: format!("unknown subscription duration: {}", value),
                field: Some("subscription_duration".to_string()),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Money {
    pub amount: BigDecimal,
    pub currency: Currency,
}

impl Money {
    pub fn new(amount: BigDecimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn validate_positive(&self, field: &str) -> Result<(), PaymentError> {
        if self.amount <= BigDecimal::from(0) {
            return Err(PaymentError::ValidationError {
                message: "amount must be greater than zero".to_string(),
                field: Some(field.to_string()),
            });
        }
        Ok(())
    }

    pub fn to_minor_units(&self) -> Result<i64, PaymentError> {
        let scaled = &self.amount * BigDecimal::from(self.currency.minor_unit_factor());
        if !scaled.is_integer() {
            return Err(PaymentError::ValidationError {
                message: format!(
                    "amount {} has more precision than {} allows",
                    self.amount, self.currency
                ),
                field: Some("amount".to_string()),
            });
        }
        scaled.to_i64().ok_or(PaymentError::ValidationError {
            message: format!("amount {} is out of range", self.amount),
            field: Some("amount".to_string()),
        })
    }

    pub fn to_f64(&self) -> Option<f64> {
        self.amount.to_f64()
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

/// Provider-independent reading of a provider status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalOutcome {
    Succeeded,
    Failed,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub merchant_reference: String,
    pub user_id: Uuid,
    pub amount: Money,
    pub plan: SubscriptionPlan,
    pub duration: SubscriptionDuration,
    pub description: String,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum HandleKind {
    RedirectUrl(String),
    ClientSecret(String),
    PollingReference(String),
}

/// Returned by an adapter after the provider accepted a payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHandle {
    pub external_ref: String,
    pub handle: HandleKind,
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StripeDetails {
    pub payment_intent_id: String,
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub reported_amount: Option<i64>,
    pub reported_currency: Option<String>,
    pub failure_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PesapalDetails {
    pub order_tracking_id: String,
    pub merchant_reference: Option<String>,
    pub confirmation_code: Option<String>,
    pub payment_method: Option<String>,
    pub status_code: Option<i64>,
    pub status_description: Option<String>,
    pub reported_amount: Option<f64>,
    pub reported_currency: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AirtelDetails {
    pub transaction_id: String,
    pub airtel_money_id: Option<String>,
    pub status_code: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderPayload {
    Stripe(StripeDetails),
    Pesapal(PesapalDetails),
    AirtelMoney(AirtelDetails),
}

impl ProviderPayload {
    pub fn provider(&self) -> ProviderName {
        match self {
            ProviderPayload::Stripe(_) => ProviderName::Stripe,
            ProviderPayload::Pesapal(_) => ProviderName::Pesapal,
            ProviderPayload::AirtelMoney(_) => ProviderName::AirtelMoney,
        }
    }

    pub fn failure_reason(&self) -> Option<String> {
        match self {
            ProviderPayload::Stripe(d) => d.failure_message.clone(),
            ProviderPayload::Pesapal(d) => d.status_description.clone(),
            ProviderPayload::AirtelMoney(d) => d.message.clone(),
        }
    }

    /// Provider identifiers worth keeping on the payment record.
    pub fn to_metadata(&self) -> JsonValue {
        match self {
            ProviderPayload::Stripe(d) => serde_json::json!({
                "payment_intent_id": d.payment_intent_id,
                "last_event_id": d.event_id,
                "last_event_type": d.event_type,
            }),
            ProviderPayload::Pesapal(d) => serde_json::json!({
                "order_tracking_id": d.order_tracking_id,
                "merchant_reference": d.merchant_reference,
                "confirmation_code": d.confirmation_code,
                "payment_method": d.payment_method,
            }),
            ProviderPayload::AirtelMoney(d) => serde_json::json!({
                "airtel_transaction_id": d.transaction_id,
                "airtel_money_id": d.airtel_money_id,
                "airtel_status_code": d.status_code,
            }),
        }
    }
}

/// Canonical event produced by every adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderStatusEvent {
    pub external_ref: String,
    pub raw_status: String,
    pub outcome: CanonicalOutcome,
    pub payload: ProviderPayload,
}

impl ProviderStatusEvent {
    pub fn provider(&self) -> ProviderName {
        self.payload.provider()
    }
}

/// What an unsigned callback tells us: which payment to re-query.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallbackRef {
    pub tracking_ref: String,
    pub merchant_ref: Option<String>,
    pub notification_type: Option<String>,
}
