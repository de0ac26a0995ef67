use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::types::ProviderName;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::warn;

pub enum RequestBody<'a> {
    Json(&'a JsonValue),
    Form(&'a [(String, String)]),
}

#[derive(Clone)]
pub struct PaymentHttpClient {
    provider: ProviderName,
    client: reqwest::Client,
    timeout: Duration,
    max_retries: u32,
}

impl PaymentHttpClient {
    pub fn new(provider: ProviderName, timeout: Duration, max_retries: u32) -> PaymentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                PaymentError::unavailable(
                    provider.as_str(),
                    format!("failed to initialize HTTP client: {}", e),
                )
            })?;

        Ok(Self {
            provider,
            client,
            timeout,
            max_retries,
        })
    }

    pub async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: &str,
        bearer_token: Option<&str>,
        body: Option<RequestBody<'_>>,
        additional_headers: &[(&str, &str)],
    ) -> PaymentResult<T> {
        let provider = self.provider.as_str();
        let mut last_error = None;
        for attempt in 0..=self.max_retries {
            let mut request = self.client.request(method.clone(), url);
            request = request.timeout(self.timeout).header("Accept", "application/json");

            if let Some(token) = bearer_token {
                request = request.bearer_auth(token);
            }
            for (k, v) in additional_headers {
                request = request.header(*k, *v);
            }
            match &body {
                Some(RequestBody::Json(payload)) => request = request.json(*payload),
                Some(RequestBody::Form(fields)) => request = request.form(*fields),
                None => {}
            }

            let response = request
                .send()
                .await
                .map_err(|e| PaymentError::unavailable(provider, format!("request failed: {}", e)));

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    if status.is_success() {
                        return serde_json::from_str::<T>(&text).map_err(|e| {
                            PaymentError::malformed(format!(
                                "invalid {} JSON response: {}",
                                provider, e
                            ))
                        });
                    }

                    if status.as_u16() == 429 {
                        if attempt < self.max_retries {
                            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                            continue;
                        }
                        return Err(PaymentError::RateLimitError {
                            message: format!("{} rate limit exceeded", provider),
                            retry_after_seconds: None,
                        });
                    }

                    if status.is_server_error() {
                        if attempt < self.max_retries {
                            warn!(
                                provider = %provider,
                                status = %status,
                                attempt = attempt + 1,
                                "provider server error, retrying"
                            );
                            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                            continue;
                        }
                        return Err(PaymentError::unavailable(
                            provider,
                            format!("HTTP {}: {}", status, text),
                        ));
                    }

                    if status.as_u16() == 401 || status.as_u16() == 403 {
                        return Err(PaymentError::AuthenticationError {
                            provider: provider.to_string(),
                            message: format!("HTTP {}: {}", status, text),
                        });
                    }

                    return Err(PaymentError::ProviderRejected {
                        provider: provider.to_string(),
                        message: format!("HTTP {}: {}", status, text),
                        provider_code: Some(status.as_u16().to_string()),
                    });
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
                        continue;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(PaymentError::unavailable(provider, "request failed")))
    }
}

pub fn hmac_sha256_hex(secret: &str, payload: &[u8]) -> Option<String> {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(hex::encode(mac.finalize().into_bytes()))
}

pub fn secure_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0_u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Keeps the last three digits of a phone number.
pub fn mask_phone_number(phone: &str) -> String {
    let digits: Vec<char> = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() <= 3 {
        return "***".to_string();
    }
    let tail: String = digits[digits.len() - 3..].iter().collect();
    format!("{}{}", "*".repeat(digits.len() - 3), tail)
}

/// Merchant reference of the form `<PREFIX>-<unix ms>-<8 hex>`.
pub fn generate_merchant_reference(provider: ProviderName) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        provider.reference_prefix(),
        chrono::Utc::now().timestamp_millis(),
        &suffix[..8]
    )
}
