use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::token_cache::{BearerTokenSource, CachedToken, TokenCache};
use crate::payments::types::{
    CallbackRef, CanonicalOutcome, Currency, HandleKind, PaymentRequest, PesapalDetails,
    ProviderHandle, ProviderName, ProviderPayload, ProviderStatusEvent,
};
use crate::payments::utils::{PaymentHttpClient, RequestBody};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct PesapalConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub base_url: String,
    pub callback_url: String,
    pub ipn_url: String,
    /// Pre-registered IPN id. Registered lazily when absent.
    pub ipn_id: Option<String>,
    pub currency: Currency,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for PesapalConfig {
    fn default() -> Self {
        Self {
            consumer_key: String::new(),
            consumer_secret: String::new(),
            base_url: "https://pay.pesapal.com/v3".to_string(),
            callback_url: String::new(),
            ipn_url: String::new(),
            ipn_id: None,
            currency: Currency::Ugx,
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl PesapalConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let consumer_key = std::env::var("PESAPAL_CONSUMER_KEY").unwrap_or_default();
        let consumer_secret = std::env::var("PESAPAL_CONSUMER_SECRET").unwrap_or_default();
        let defaults = Self::default();

        let config = Self {
            consumer_key,
            consumer_secret,
            base_url: std::env::var("PESAPAL_BASE_URL").unwrap_or(defaults.base_url),
            callback_url: std::env::var("PESAPAL_CALLBACK_URL").unwrap_or_default(),
            ipn_url: std::env::var("PESAPAL_IPN_URL").unwrap_or_default(),
            ipn_id: std::env::var("PESAPAL_IPN_ID")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            currency: match std::env::var("PESAPAL_CURRENCY") {
                Ok(v) => Currency::from_str(&v)?,
                Err(_) => defaults.currency,
            },
            timeout_secs: std::env::var("PESAPAL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("PESAPAL_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults.max_retries),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PaymentResult<()> {
        if self.consumer_key.trim().is_empty() || self.consumer_secret.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "PESAPAL_CONSUMER_KEY and PESAPAL_CONSUMER_SECRET are required"
                    .to_string(),
                field: Some("pesapal".to_string()),
            });
        }
        if self.callback_url.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "PESAPAL_CALLBACK_URL is required".to_string(),
                field: Some("PESAPAL_CALLBACK_URL".to_string()),
            });
        }
        if self.ipn_id.is_none() && self.ipn_url.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "either PESAPAL_IPN_ID or PESAPAL_IPN_URL must be set".to_string(),
                field: Some("PESAPAL_IPN_URL".to_string()),
            });
        }
        Ok(())
    }
}

const PESAPAL_CURRENCIES: &[Currency] = &[Currency::Ugx, Currency::Usd];

pub struct PesapalProvider {
    config: PesapalConfig,
    http: PaymentHttpClient,
    tokens: BearerTokenSource,
    ipn_id: OnceCell<String>,
}

impl PesapalProvider {
    pub fn new(config: PesapalConfig, token_cache: Arc<dyn TokenCache>) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            ProviderName::Pesapal,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        let ipn_id = match config.ipn_id.clone() {
            Some(id) => OnceCell::new_with(Some(id)),
            None => OnceCell::new(),
        };
        Ok(Self {
            tokens: BearerTokenSource::new(
                token_cache,
                ProviderName::Pesapal,
                chrono::Duration::minutes(1),
            ),
            config,
            http,
            ipn_id,
        })
    }

    pub fn from_env(token_cache: Arc<dyn TokenCache>) -> PaymentResult<Self> {
        Self::new(PesapalConfig::from_env()?, token_cache)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn access_token(&self) -> PaymentResult<String> {
        self.tokens
            .bearer(|| async {
                let body = serde_json::json!({
                    "consumer_key": self.config.consumer_key,
                    "consumer_secret": self.config.consumer_secret,
                });
                let response: PesapalTokenResponse = self
                    .http
                    .request_json(
                        reqwest::Method::POST,
                        &self.endpoint("/api/Auth/RequestToken"),
                        None,
                        Some(RequestBody::Json(&body)),
                        &[],
                    )
                    .await?;
                response.into_cached_token()
            })
            .await
    }

    async fn notification_id(&self) -> PaymentResult<String> {
        self.ipn_id
            .get_or_try_init(|| async {
                let token = self.access_token().await?;
                let body = serde_json::json!({
                    "url": self.config.ipn_url,
                    "ipn_notification_type": "POST",
                });
                let response: PesapalIpnRegistration = self
                    .http
                    .request_json(
                        reqwest::Method::POST,
                        &self.endpoint("/api/URLSetup/RegisterIPN"),
                        Some(&token),
                        Some(RequestBody::Json(&body)),
                        &[],
                    )
                    .await?;
                if let Some(error) = response.error.filter(|e| !e.is_null()) {
                    return Err(PaymentError::ProviderRejected {
                        provider: ProviderName::Pesapal.to_string(),
                        message: format!("IPN registration failed: {}", error),
                        provider_code: None,
                    });
                }
                let ipn_id = response
                    .ipn_id
                    .ok_or_else(|| PaymentError::malformed("RegisterIPN returned no ipn_id"))?;
                info!(ipn_id = %ipn_id, "pesapal IPN url registered");
                Ok(ipn_id)
            })
            .await
            .cloned()
    }
}

/// Maps PesaPal's numeric `status_code`.
pub fn map_status_code(code: Option<i64>) -> CanonicalOutcome {
    match code {
        Some(1) => CanonicalOutcome::Succeeded,
        Some(2) | Some(3) => CanonicalOutcome::Failed,
        _ => CanonicalOutcome::Pending,
    }
}

pub(crate) fn event_from_status(
    order_tracking_id: &str,
    status: PesapalTransactionStatus,
) -> ProviderStatusEvent {
    let outcome = map_status_code(status.status_code);
    let raw_status = status
        .payment_status_description
        .clone()
        .unwrap_or_else(|| format!("status_code={:?}", status.status_code));
    ProviderStatusEvent {
        external_ref: order_tracking_id.to_string(),
        raw_status,
        outcome,
        payload: ProviderPayload::Pesapal(PesapalDetails {
            order_tracking_id: order_tracking_id.to_string(),
            merchant_reference: status.merchant_reference,
            confirmation_code: status.confirmation_code.filter(|c| !c.is_empty()),
            payment_method: status.payment_method,
            status_code: status.status_code,
            status_description: status.payment_status_description.or(status.description),
            reported_amount: status.amount,
            reported_currency: status.currency,
        }),
    }
}

#[async_trait]
impl PaymentProvider for PesapalProvider {
    fn name(&self) -> ProviderName {
        ProviderName::Pesapal
    }

    fn supported_currencies(&self) -> &'static [Currency] {
        PESAPAL_CURRENCIES
    }

    fn default_currency(&self) -> Currency {
        self.config.currency
    }

    async fn initiate(&self, request: PaymentRequest) -> PaymentResult<ProviderHandle> {
        request.amount.validate_positive("amount")?;
        let amount = request
            .amount
            .to_f64()
            .ok_or_else(|| PaymentError::ValidationError {
                message: "amount is out of range".to_string(),
                field: Some("amount".to_string()),
            })?;

        let notification_id = self.notification_id().await?;
        let token = self.access_token().await?;
        let callback_url = request
            .callback_url
            .clone()
            .unwrap_or_else(|| self.config.callback_url.clone());

        let body = serde_json::json!({
            "id": request.merchant_reference,
            "currency": request.amount.currency.as_str(),
            "amount": amount,
            "description": request.description,
            "callback_url": callback_url,
            "notification_id": notification_id,
            "billing_address": {
                "email_address": request.email,
                "phone_number": request.phone_number,
            },
        });

        let response: PesapalOrderResponse = self
            .http
            .request_json(
                reqwest::Method::POST,
                &self.endpoint("/api/Transactions/SubmitOrderRequest"),
                Some(&token),
                Some(RequestBody::Json(&body)),
                &[],
            )
            .await?;

        if let Some(error) = response.error.filter(|e| !e.is_null()) {
            return Err(PaymentError::ProviderRejected {
                provider: ProviderName::Pesapal.to_string(),
                message: error.to_string(),
                provider_code: response.status,
            });
        }
        let order_tracking_id = response
            .order_tracking_id
            .ok_or_else(|| PaymentError::malformed("order response has no order_tracking_id"))?;
        let redirect_url = response
            .redirect_url
            .ok_or_else(|| PaymentError::malformed("order response has no redirect_url"))?;

        info!(
            order_tracking_id = %order_tracking_id,
            merchant_reference = %request.merchant_reference,
            "pesapal order submitted"
        );

        Ok(ProviderHandle {
            external_ref: order_tracking_id.clone(),
            handle: HandleKind::RedirectUrl(redirect_url.clone()),
            metadata: serde_json::json!({
                "order_tracking_id": order_tracking_id,
                "merchant_reference": request.merchant_reference,
                "redirect_url": redirect_url,
            }),
        })
    }

    async fn query_status(&self, external_ref: &str) -> PaymentResult<ProviderStatusEvent> {
        if external_ref.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "order tracking id is required".to_string(),
                field: Some("external_ref".to_string()),
            });
        }
        let token = self.access_token().await?;
        let url = self.endpoint(&format!(
            "/api/Transactions/GetTransactionStatus?orderTrackingId={}",
            external_ref
        ));
        let status: PesapalTransactionStatus = match self
            .http
            .request_json(reqwest::Method::GET, &url, Some(&token), None, &[])
            .await
        {
            Ok(status) => status,
            Err(e @ PaymentError::AuthenticationError { .. }) => {
                debug!("pesapal token rejected; dropping cached token");
                self.tokens.invalidate().await;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        Ok(event_from_status(external_ref, status))
    }

    fn parse_callback(&self, payload: &[u8]) -> PaymentResult<CallbackRef> {
        let ipn: PesapalIpn = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::malformed(format!("invalid pesapal IPN: {}", e)))?;
        if ipn.order_tracking_id.trim().is_empty() {
            return Err(PaymentError::malformed("IPN has an empty OrderTrackingId"));
        }
        Ok(CallbackRef {
            tracking_ref: ipn.order_tracking_id,
            merchant_ref: ipn.order_merchant_reference,
            notification_type: ipn.order_notification_type,
        })
    }

    fn callback_ack(&self, callback: Option<&CallbackRef>) -> JsonValue {
        serde_json::json!({
            "orderNotificationType": callback
                .and_then(|c| c.notification_type.clone())
                .unwrap_or_else(|| "IPNCHANGE".to_string()),
            "orderTrackingId": callback.map(|c| c.tracking_ref.clone()),
            "orderMerchantReference": callback.and_then(|c| c.merchant_ref.clone()),
            "status": 200,
        })
    }
}

#[derive(Debug, Deserialize)]
struct PesapalTokenResponse {
    token: Option<String>,
    #[serde(rename = "expiryDate")]
    expiry_date: Option<String>,
    #[serde(default)]
    error: Option<JsonValue>,
}

impl PesapalTokenResponse {
    fn into_cached_token(self) -> PaymentResult<CachedToken> {
        if let Some(error) = self.error.filter(|e| !e.is_null()) {
            return Err(PaymentError::AuthenticationError {
                provider: ProviderName::Pesapal.to_string(),
                message: error.to_string(),
            });
        }
        let token = self.token.ok_or_else(|| PaymentError::AuthenticationError {
            provider: ProviderName::Pesapal.to_string(),
            message: "token response carried no token".to_string(),
        })?;
        let expires_at = self
            .expiry_date
            .as_deref()
            .and_then(parse_expiry)
            .unwrap_or_else(|| Utc::now() + chrono::Duration::minutes(5));
        Ok(CachedToken::new(token, expires_at))
    }
}

/// PesaPal sends `expiryDate` either as RFC 3339 or without an offset (UTC).
fn parse_expiry(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Deserialize)]
struct PesapalIpnRegistration {
    ipn_id: Option<String>,
    #[serde(default)]
    error: Option<JsonValue>,
}

#[derive(Debug, Deserialize)]
struct PesapalOrderResponse {
    order_tracking_id: Option<String>,
    redirect_url: Option<String>,
    #[serde(default)]
    error: Option<JsonValue>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PesapalTransactionStatus {
    #[serde(default)]
    payment_method: Option<String>,
    #[serde(default)]
    amount: Option<f64>,
    #[serde(default)]
    payment_status_description: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    confirmation_code: Option<String>,
    #[serde(default)]
    merchant_reference: Option<String>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    status_code: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PesapalIpn {
    #[serde(rename = "OrderTrackingId")]
    order_tracking_id: String,
    #[serde(rename = "OrderMerchantReference", default)]
    order_merchant_reference: Option<String>,
    #[serde(rename = "OrderNotificationType", default)]
    order_notification_type: Option<String>,
}
