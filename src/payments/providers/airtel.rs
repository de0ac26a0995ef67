use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::token_cache::{BearerTokenSource, CachedToken, TokenCache};
use crate::payments::types::{
    AirtelDetails, CallbackRef, CanonicalOutcome, Currency, HandleKind, PaymentRequest,
    ProviderHandle, ProviderName, ProviderPayload, ProviderStatusEvent,
};
use crate::payments::utils::{mask_phone_number, PaymentHttpClient, RequestBody};
use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct AirtelConfig {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
    pub country: String,
    pub currency: Currency,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for AirtelConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            base_url: "https://openapi.airtel.africa".to_string(),
            country: "UG".to_string(),
            currency: Currency::Ugx,
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

impl AirtelConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let defaults = Self::default();
        let config = Self {
            client_id: std::env::var("AIRTEL_CLIENT_ID").unwrap_or_default(),
            client_secret: std::env::var("AIRTEL_CLIENT_SECRET").unwrap_or_default(),
            base_url: std::env::var("AIRTEL_BASE_URL").unwrap_or(defaults.base_url),
            country: std::env::var("AIRTEL_COUNTRY").unwrap_or(defaults.country),
            currency: defaults.currency,
            timeout_secs: std::env::var("AIRTEL_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(defaults.timeout_secs),
            max_retries: std::env::var("AIRTEL_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(defaults.max_retries),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> PaymentResult<()> {
        if self.client_id.trim().is_empty() || self.client_secret.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "AIRTEL_CLIENT_ID and AIRTEL_CLIENT_SECRET are required".to_string(),
                field: Some("airtel_money".to_string()),
            });
        }
        Ok(())
    }
}

const AIRTEL_CURRENCIES: &[Currency] = &[Currency::Ugx];

fn msisdn_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^7\d{8}$").expect("valid MSISDN regex"))
}

/// Normalizes a Ugandan Airtel number to the 9-digit national form Airtel
/// expects (`7XXXXXXXX`). Accepts `+256…`, `256…` and `0…` prefixes.
pub fn normalize_msisdn(raw: &str) -> PaymentResult<String> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let national = if let Some(rest) = digits.strip_prefix("256") {
        rest
    } else if let Some(rest) = digits.strip_prefix('0') {
        rest
    } else {
        digits.as_str()
    };

    if msisdn_regex().is_match(national) {
        Ok(national.to_string())
    } else {
        Err(PaymentError::ValidationError {
            message: format!("invalid Airtel Money number: {}", mask_phone_number(raw)),
            field: Some("phone_number".to_string()),
        })
    }
}

/// Maps Airtel's transaction status codes.
pub fn map_transaction_status(code: &str) -> CanonicalOutcome {
    match code {
        "TS" => CanonicalOutcome::Succeeded,
        "TF" => CanonicalOutcome::Failed,
        _ => CanonicalOutcome::Pending,
    }
}

pub struct AirtelMoneyProvider {
    config: AirtelConfig,
    http: PaymentHttpClient,
    tokens: BearerTokenSource,
}

impl AirtelMoneyProvider {
    pub fn new(config: AirtelConfig, token_cache: Arc<dyn TokenCache>) -> PaymentResult<Self> {
        let http = PaymentHttpClient::new(
            ProviderName::AirtelMoney,
            Duration::from_secs(config.timeout_secs),
            config.max_retries,
        )?;
        Ok(Self {
            tokens: BearerTokenSource::new(
                token_cache,
                ProviderName::AirtelMoney,
                chrono::Duration::minutes(5),
            ),
            config,
            http,
        })
    }

    pub fn from_env(token_cache: Arc<dyn TokenCache>) -> PaymentResult<Self> {
        Self::new(AirtelConfig::from_env()?, token_cache)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn access_token(&self) -> PaymentResult<String> {
        self.tokens
            .bearer(|| async {
                let body = serde_json::json!({
                    "client_id": self.config.client_id,
                    "client_secret": self.config.client_secret,
                    "grant_type": "client_credentials",
                });
                let response: AirtelTokenResponse = self
                    .http
                    .request_json(
                        reqwest::Method::POST,
                        &self.endpoint("/auth/oauth2/token"),
                        None,
                        Some(RequestBody::Json(&body)),
                        &[],
                    )
                    .await?;
                Ok(response.into_cached_token())
            })
            .await
    }

    async fn authorized_json<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&JsonValue>,
    ) -> PaymentResult<T> {
        let token = self.access_token().await?;
        let headers = [
            ("X-Country", self.config.country.as_str()),
            ("X-Currency", self.config.currency.as_str()),
        ];
        let result = self
            .http
            .request_json(
                method,
                &self.endpoint(path),
                Some(&token),
                body.map(RequestBody::Json),
                &headers,
            )
            .await;
        if let Err(PaymentError::AuthenticationError { .. }) = &result {
            debug!("airtel token rejected; dropping cached token");
            self.tokens.invalidate().await;
        }
        result
    }
}

pub(crate) fn event_from_status(transaction_id: &str, data: AirtelTransaction) -> ProviderStatusEvent {
    let status_code = data.status.unwrap_or_else(|| "TIP".to_string());
    ProviderStatusEvent {
        external_ref: transaction_id.to_string(),
        raw_status: status_code.clone(),
        outcome: map_transaction_status(&status_code),
        payload: ProviderPayload::AirtelMoney(AirtelDetails {
            transaction_id: transaction_id.to_string(),
            airtel_money_id: data.airtel_money_id,
            status_code,
            message: data.message,
        }),
    }
}

#[async_trait]
impl PaymentProvider for AirtelMoneyProvider {
    fn name(&self) -> ProviderName {
        ProviderName::AirtelMoney
    }

    fn supported_currencies(&self) -> &'static [Currency] {
        AIRTEL_CURRENCIES
    }

    fn default_currency(&self) -> Currency {
        self.config.currency
    }

    async fn initiate(&self, request: PaymentRequest) -> PaymentResult<ProviderHandle> {
        request.amount.validate_positive("amount")?;
        let phone = request
            .phone_number
            .as_deref()
            .ok_or_else(|| PaymentError::ValidationError {
                message: "phone_number is required for Airtel Money".to_string(),
                field: Some("phone_number".to_string()),
            })?;
        let msisdn = normalize_msisdn(phone)?;
        let amount = request.amount.to_minor_units()?;

        // Airtel has no id of its own at push time; the merchant reference
        // doubles as the transaction id we poll with.
        let transaction_id = request.merchant_reference.clone();
        let body = serde_json::json!({
            "reference": request.description,
            "subscriber": {
                "country": self.config.country,
                "currency": self.config.currency.as_str(),
                "msisdn": msisdn,
            },
            "transaction": {
                "amount": amount,
                "country": self.config.country,
                "currency": self.config.currency.as_str(),
                "id": transaction_id,
            },
        });

        let response: AirtelEnvelope<JsonValue> = self
            .authorized_json(reqwest::Method::POST, "/merchant/v1/payments/", Some(&body))
            .await?;
        response.ensure_success()?;

        info!(
            transaction_id = %transaction_id,
            msisdn = %mask_phone_number(&msisdn),
            "airtel money USSD push sent"
        );

        Ok(ProviderHandle {
            external_ref: transaction_id.clone(),
            handle: HandleKind::PollingReference(transaction_id.clone()),
            metadata: serde_json::json!({
                "airtel_transaction_id": transaction_id,
                "msisdn": mask_phone_number(&msisdn),
            }),
        })
    }

    async fn query_status(&self, external_ref: &str) -> PaymentResult<ProviderStatusEvent> {
        if external_ref.trim().is_empty() {
            return Err(PaymentError::ValidationError {
                message: "transaction id is required".to_string(),
                field: Some("external_ref".to_string()),
            });
        }
        let response: AirtelEnvelope<AirtelStatusData> = self
            .authorized_json(
                reqwest::Method::GET,
                &format!("/standard/v1/payments/{}", external_ref),
                None,
            )
            .await?;
        response.ensure_success()?;
        let transaction = response
            .data
            .map(|d| d.transaction)
            .ok_or_else(|| PaymentError::malformed("status response has no transaction"))?;

        Ok(event_from_status(external_ref, transaction))
    }

    fn parse_callback(&self, payload: &[u8]) -> PaymentResult<CallbackRef> {
        let callback: AirtelCallback = serde_json::from_slice(payload)
            .map_err(|e| PaymentError::malformed(format!("invalid airtel callback: {}", e)))?;
        if callback.transaction.id.trim().is_empty() {
            return Err(PaymentError::malformed("callback has an empty transaction id"));
        }
        Ok(CallbackRef {
            tracking_ref: callback.transaction.id,
            merchant_ref: None,
            notification_type: callback.transaction.status_code,
        })
    }

    fn callback_ack(&self, callback: Option<&CallbackRef>) -> JsonValue {
        serde_json::json!({
            "status": "received",
            "transaction_id": callback.map(|c| c.tracking_ref.clone()),
        })
    }
}

const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;
/// Longer lifetimes are capped; the cache refreshes at least daily.
const MAX_TOKEN_LIFETIME_SECS: i64 = 86_400;

#[derive(Debug, Deserialize)]
struct AirtelTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<JsonValue>,
}

impl AirtelTokenResponse {
    fn into_cached_token(self) -> CachedToken {
        // `expires_in` arrives as a number or a numeric string.
        let seconds = match &self.expires_in {
            Some(JsonValue::Number(n)) => n.as_i64(),
            Some(JsonValue::String(s)) => s.parse::<i64>().ok(),
            _ => None,
        }
        .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS)
        .clamp(0, MAX_TOKEN_LIFETIME_SECS);
        CachedToken::new(self.access_token, Utc::now() + chrono::Duration::seconds(seconds))
    }
}

#[derive(Debug, Deserialize)]
struct AirtelEnvelope<T> {
    data: Option<T>,
    status: AirtelResponseStatus,
}

impl<T> AirtelEnvelope<T> {
    fn ensure_success(&self) -> PaymentResult<()> {
        if self.status.success {
            Ok(())
        } else {
            Err(PaymentError::ProviderRejected {
                provider: ProviderName::AirtelMoney.to_string(),
                message: self
                    .status
                    .message
                    .clone()
                    .unwrap_or_else(|| "request was not successful".to_string()),
                provider_code: self.status.response_code.clone(),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
struct AirtelResponseStatus {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    response_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AirtelStatusData {
    transaction: AirtelTransaction,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AirtelTransaction {
    #[serde(default)]
    airtel_money_id: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AirtelCallback {
    transaction: AirtelCallbackTransaction,
}

#[derive(Debug, Deserialize)]
struct AirtelCallbackTransaction {
    id: String,
    #[serde(default)]
    status_code: Option<String>,
}
