use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::types::{
    CanonicalOutcome, Currency, HandleKind, PaymentRequest, ProviderHandle, ProviderName,
    ProviderPayload, ProviderStatusEvent, StripeDetails,
};
use crate::payments::utils::{hmac_sha256_hex, secure_eq, PaymentHttpClient, RequestBody};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    pub webhook_secret: String,
    pub base_url: String,
    pub currency: Currency,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub signature_tolerance_secs: i64,
}

impl Default for StripeConfig {
    fn default() -> Self {
        Self {
            secret_key: String::new(),
            webhook_secret: String::new(),
            base_url: "https://api.stripe.com".to_string(),
            currency: Currency::Usd,
            timeout_secs: 30,
            max_retries: 2,
            signature_tolerance_secs: 300,
        }
    }
}

impl StripeConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let secret_key =
            std::env::var("STRIPE_SECRET_KEY").map_err(|_| PaymentError::ValidationError {
                message: "STRIPE_SECRET_KEY environment variable is required".to_string(),
                field: Some("STRIPE_SECRET_KEY".to_string()),
            })?;
        let webhook_secret =
            std::env::var("STRIPE_WEBHOOK_SECRET").map_err(|_| PaymentError::ValidationError {
                message: "STRIPE_WEBHOOK_SECRET environment variable is required".to_string(),
                field: Some("STRIPE_WEBHOOK_SECRET".to_string()),
            })?;
        let defaults = Self::default();

        let config = Self {
            secret_key,
            webhook_secret,
            base_url: std::env::var("STRIPE_BASE_URL").unwrap_or(defaults.base_url),
            currency: match std::env::var("STRIPE_CURRENCY") {
                Ok(v) => Currency::from_str(&v)?,
                Err(_) => defaults.currency,
            },
            timeout_secs: std::env::var("STRIPE_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("STRIPE_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults.max_retries),
            signature_tolerance_secs: defaults.signature_tolerance_secs,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PaymentResult<()> {
        if self.secret_key.trim().is_empty() || self.webhook_secret.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "stripe secret key and webhook secret cannot be empty".to_string(),
                field: Some("stripe".to_string()),
            });
        }
        if !STRIPE_CURRENCIES.contains(&self.currency) {
            return Err(PaymentError::ValidationError {
                message: format!("stripe cannot charge in {}", self.currency),
                field: Some("STRIPE_CURRENCY".to_string()),
            });
        }
        Ok(())
    }
}

const STRIPE_CURRENCIES: &[Currency] = &[Currency::Usd, Currency::Eur, Currency::Gbp, Currency::Ugx];

pub struct StripeProvider {
    config: StripeConfig,
    http: PaymentHttpClient,
}

impl StripeProvider {
    pub fn new(config: StripeConfig) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            ProviderName::Stripe,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> PaymentResult<Self> {
        Self::new(StripeConfig::from_env()?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    /// Checks a `Stripe-Signature` header (`t=<unix>,v1=<hex>`) against the
    /// raw request body.
    pub fn verify_signature(
        &self,
        payload: &[u8],
        header: &str,
        now_unix: i64,
    ) -> PaymentResult<()> {
        let parsed = SignatureHeader::parse(header)?;

        let skew = now_unix
            .checked_sub(parsed.timestamp)
            .and_then(i64::checked_abs);
        if skew.map_or(true, |skew| skew > self.config.signature_tolerance_secs) {
            return Err(PaymentError::InvalidSignature {
                message: "signature timestamp outside tolerance".to_string(),
            });
        }

        let mut signed = parsed.timestamp.to_string().into_bytes();
        signed.push(b'.');
        signed.extend_from_slice(payload);

        let expected = hmac_sha256_hex(&self.config.webhook_secret, &signed).ok_or(
            PaymentError::InvalidSignature {
                message: "webhook secret is unusable".to_string(),
            },
        )?;

        if parsed
            .v1_signatures
            .iter()
            .any(|candidate| secure_eq(expected.as_bytes(), candidate.as_bytes()))
        {
            Ok(())
        } else {
            Err(PaymentError::InvalidSignature {
                message: "no matching v1 signature".to_string(),
            })
        }
    }

    fn event_from_intent(
        intent: StripePaymentIntent,
        outcome: CanonicalOutcome,
        event_id: Option<String>,
        event_type: Option<String>,
    ) -> ProviderStatusEvent {
        let raw_status = event_type.clone().unwrap_or_else(|| intent.status.clone());
        ProviderStatusEvent {
            external_ref: intent.id.clone(),
            raw_status,
            outcome,
            payload: ProviderPayload::Stripe(StripeDetails {
                payment_intent_id: intent.id,
                event_id,
                event_type,
                reported_amount: intent.amount_received.or(Some(intent.amount)),
                reported_currency: Some(intent.currency),
                failure_message: intent.last_payment_error.and_then(|e| e.message),
            }),
        }
    }
}

/// Maps a payment intent status. `requires_payment_method` after a failed
/// attempt stays pending because the customer may retry on the same intent.
pub fn map_intent_status(status: &str) -> CanonicalOutcome {
    match status {
        "succeeded" => CanonicalOutcome::Succeeded,
        "canceled" => CanonicalOutcome::Failed,
        _ => CanonicalOutcome::Pending,
    }
}

pub fn map_event_type(event_type: &str, intent_status: &str) -> CanonicalOutcome {
    match event_type {
        "payment_intent.succeeded" => CanonicalOutcome::Succeeded,
        "payment_intent.canceled" => CanonicalOutcome::Failed,
        _ => map_intent_status(intent_status),
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Stripe
    }

    fn supported_currencies(&self) -> &'static [Currency] {
        STRIPE_CURRENCIES
    }

    fn default_currency(&self) -> Currency {
        self.config.currency
    }

    async fn initiate(&self, request: PaymentRequest) -> PaymentResult<ProviderHandle> {
        request.amount.validate_positive("amount")?;
        let minor_units = request.amount.to_minor_units()?;

        let form: Vec<(String, String)> = vec![
            ("amount".to_string(), minor_units.to_string()),
            (
                "currency".to_string(),
                request.amount.currency.as_str().to_lowercase(),
            ),
            ("description".to_string(), request.description.clone()),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
            (
                "metadata[merchant_reference]".to_string(),
                request.merchant_reference.clone(),
            ),
            ("metadata[user_id]".to_string(), request.user_id.to_string()),
            (
                "metadata[subscription_plan]".to_string(),
                request.plan.as_str().to_string(),
            ),
            (
                "metadata[subscription_duration]".to_string(),
                request.duration.as_str().to_string(),
            ),
        ];

        let intent: StripePaymentIntent = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/v1/payment_intents"),
                Some(&self.config.secret_key),
                Some(RequestBody::Form(&form)),
                &[("Idempotency-Key", request.merchant_reference.as_str())],
            )
            .await?;

        let client_secret = intent
            .client_secret
            .clone()
            .ok_or_else(|| PaymentError::malformed("payment intent has no client_secret"))?;
        info!(
            payment_intent = %intent.id,
            merchant_reference = %request.merchant_reference,
            "stripe payment intent created"
        );

        Ok(ProviderHandle {
            external_ref: intent.id.clone(),
            handle: HandleKind::ClientSecret(client_secret),
            metadata: serde_json::json!({
                "payment_intent_id": intent.id,
                "merchant_reference": request.merchant_reference,
            }),
        })
    }

    async fn query_status(&self, external_ref: &str) -> PaymentResult<ProviderStatusEvent> {
        if external_ref.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "payment intent id is required".to_string(),
                field: Some("external_ref".to_string()),
            });
        }
        let intent: StripePaymentIntent = self
            .http
            .request_json(
                reqwest::Method::GET,
                &self.endpoint(&format!("/v1/payment_intents/{}", external_ref)),
                Some(&self.config.secret_key),
                None,
                &[],
            )
            .await?;

        let outcome = map_intent_status(&intent.status);
        Ok(Self::event_from_intent(intent, outcome, None, None))
    }

    fn parse_webhook(
        &self,
        payload: &[u8],
        signature: &str,
    ) -> PaymentResult<Option<ProviderStatusEvent>> {
        self.verify_signature(payload, signature, chrono::Utc::now().timestamp())?;

        let event: StripeEvent = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::malformed(format!("invalid stripe event: {}", e)))?;

        if !event.event_type.starts_with("payment_intent.") {
            info!(event_id = %event.id, event_type = %event.event_type, "ignoring stripe event");
            return Ok(None);
        }

        let intent: StripePaymentIntent = serde_json::from_value(event.data.object)
            .map_err(|e| PaymentError::malformed(format!("invalid payment intent: {}", e)))?;
        let outcome = map_event_type(&event.event_type, &intent.status);
        if event.event_type == "payment_intent.payment_failed" {
            warn!(
                payment_intent = %intent.id,
                "stripe reported a failed attempt; intent remains open for retry"
            );
        }

        Ok(Some(Self::event_from_intent(
            intent,
            outcome,
            Some(event.id),
            Some(event.event_type),
        )))
    }
}

struct SignatureHeader {
    timestamp: i64,
    v1_signatures: Vec<String>,
}

impl SignatureHeader {
    fn parse(header: &str) -> PaymentResult<Self> {
        let mut timestamp = None;
        let mut v1_signatures = Vec::new();
        for part in header.split(',') {
            let mut kv = part.trim().splitn(2, '=');
            match (kv.next(), kv.next()) {
                (Some("t"), Some(v)) => timestamp = v.parse::<i64>().ok(),
                (Some("v1"), Some(v)) => v1_signatures.push(v.to_string()),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or(PaymentError::InvalidSignature {
            message: "missing timestamp in signature header".to_string(),
        })?;
        if v1_signatures.is_empty() {
            return Err(PaymentError::InvalidSignature {
                message: "missing v1 signature in signature header".to_string(),
            });
        }
        Ok(Self {
            timestamp,
            v1_signatures,
        })
    }
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: JsonValue,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
    amount: i64,
    #[serde(default)]
    amount_received: Option<i64>,
    currency: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    last_payment_error: Option<StripeLastError>,
}

#[derive(Debug, Deserialize)]
struct StripeLastError {
    #[serde(default)]
    message: Option<String>,
}

#[cfg(test)]
pub(crate) fn sign_for_tests(secret: &str, timestamp: i64, payload: &str) -> String {
    let signed = format!("{}.{}", timestamp, payload);
    let sig = hmac_sha256_hex(secret, signed.as_bytes()).expect("hmac key");
    format!("t={},v1={}", timestamp, sig)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> StripeProvider {
        StripeProvider::new(StripeConfig {
            secret_key: "sk_test".to_string(),
            webhook_secret: "whsec_test".to_string(),
            ..StripeConfig::default()
        })
        .expect("provider init should succeed")
    }

    fn succeeded_event() -> String {
        serde_json::json!({
            "id": "evt_1",
            "type": "payment_intent.succeeded",
            "data": {"object": {
                "id": "pi_123",
                "status": "succeeded",
                "amount": 899,
                "amount_received": 899,
                "currency": "usd",
                "metadata": {"merchant_reference": "STR-1"}
            }}
        })
        .to_string()
    }

    #[test]
    fn valid_signature_yields_succeeded_event() {
        let provider = provider();
        let body = succeeded_event();
        let header = sign_for_tests("whsec_test", chrono::Utc::now().timestamp(), &body);

        let event = provider
            .parse_webhook(body.as_bytes(), &header)
            .expect("webhook should verify")
            .expect("payment intent event");
        assert_eq!(event.external_ref, "pi_123");
        assert_eq!(event.outcome, CanonicalOutcome::Succeeded);
        assert_eq!(event.raw_status, "payment_intent.succeeded");
    }

    #[test]
    fn tampered_body_is_rejected() {
        let provider = provider();
        let body = succeeded_event();
        let header = sign_for_tests("whsec_test", chrono::Utc::now().timestamp(), &body);
        let tampered = body.replace("899", "1");

        let err = provider
            .parse_webhook(tampered.as_bytes(), &header)
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidSignature { .. }));
    }

    #[test]
    fn wrong_secret_and_stale_timestamp_are_rejected() {
        let provider = provider();
        let body = succeeded_event();
        let now = chrono::Utc::now().timestamp();

        let wrong = sign_for_tests("whsec_other", now, &body);
        assert!(provider.verify_signature(body.as_bytes(), &wrong, now).is_err());

        let stale = sign_for_tests("whsec_test", now - 3600, &body);
        assert!(provider.verify_signature(body.as_bytes(), &stale, now).is_err());

        assert!(provider
            .verify_signature(body.as_bytes(), "v1=deadbeef", now)
            .is_err());
    }

    #[test]
    fn extreme_timestamps_are_rejected_not_overflowed() {
        let provider = provider();
        let now = chrono::Utc::now().timestamp();

        for timestamp in [i64::MIN, i64::MAX] {
            let header = format!("t={},v1=00", timestamp);
            let err = provider
                .verify_signature(b"{}", &header, now)
                .unwrap_err();
            assert!(matches!(err, PaymentError::InvalidSignature { .. }));
        }

        let err = provider
            .parse_webhook(b"{}", "t=-9223372036854775808,v1=00")
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidSignature { .. }));
    }

    #[test]
    fn unrelated_event_types_are_ignored() {
        let provider = provider();
        let body = serde_json::json!({
            "id": "evt_2",
            "type": "customer.created",
            "data": {"object": {"id": "cus_1"}}
        })
        .to_string();
        let header = sign_for_tests("whsec_test", chrono::Utc::now().timestamp(), &body);
        assert!(provider
            .parse_webhook(body.as_bytes(), &header)
            .unwrap()
            .is_none());
    }

    #[test]
    fn intent_status_mapping() {
        assert_eq!(map_intent_status("succeeded"), CanonicalOutcome::Succeeded);
        assert_eq!(map_intent_status("canceled"), CanonicalOutcome::Failed);
        assert_eq!(map_intent_status("processing"), CanonicalOutcome::Pending);
        assert_eq!(
            map_intent_status("requires_payment_method"),
            CanonicalOutcome::Pending
        );
        assert_eq!(
            map_event_type("payment_intent.payment_failed", "requires_payment_method"),
            CanonicalOutcome::Pending
        );
        assert_eq!(
            map_event_type("payment_intent.canceled", "canceled"),
            CanonicalOutcome::Failed
        );
    }
}
