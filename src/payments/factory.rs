use crate::payments::error::{PaymentError, PaymentResult};
use crate::payments::provider::PaymentProvider;
use crate::payments::providers::{AirtelMoneyProvider, PesapalProvider, StripeProvider};
use crate::payments::token_cache::TokenCache;
use crate::payments::types::ProviderName;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PaymentFactoryConfig {
    pub enabled_providers: Vec<ProviderName>,
}

impl Default for PaymentFactoryConfig {
    fn default() -> Self {
        Self {
            enabled_providers: vec![
                ProviderName::Stripe,
                ProviderName::Pesapal,
                ProviderName::AirtelMoney,
            ],
        }
    }
}

impl PaymentFactoryConfig {
    pub fn from_env() -> PaymentResult<Self> {
        let enabled_raw = match std::env::var("ENABLED_PAYMENT_PROVIDERS") {
            Ok(raw) => raw,
            Err(_) => return Ok(Self::default()),
        };

        let mut enabled_providers = Vec::new();
        for part in enabled_raw.split(',') {
            let value = part.trim();
            if value.is_empty() {
                continue;
            }
            let provider = ProviderName::from_str(value)?;
            if !enabled_providers.contains(&provider) {
                enabled_providers.push(provider);
            }
        }

        if enabled_providers.is_empty() {
            return Err(PaymentError::ValidationError {
                message: "at least one payment provider must be enabled".to_string(),
                field: Some("ENABLED_PAYMENT_PROVIDERS".to_string()),
            });
        }

        Ok(Self { enabled_providers })
    }
}

/// Adapters are constructed once and shared, so OAuth tokens and the PesaPal
/// IPN id survive between requests.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderName, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds every enabled adapter from the environment. An adapter whose
    /// configuration is incomplete is skipped with a warning.
    pub fn from_env(
        config: &PaymentFactoryConfig,
        token_cache: Arc<dyn TokenCache>,
    ) -> PaymentResult<Self> {
        let mut registry = Self::new();
        for provider in &config.enabled_providers {
            let built: PaymentResult<Arc<dyn PaymentProvider>> = match provider {
                ProviderName::Stripe => {
                    StripeProvider::from_env().map(|p| Arc::new(p) as Arc<dyn PaymentProvider>)
                }
                ProviderName::Pesapal => PesapalProvider::from_env(token_cache.clone())
                    .map(|p| Arc::new(p) as Arc<dyn PaymentProvider>),
                ProviderName::AirtelMoney => AirtelMoneyProvider::from_env(token_cache.clone())
                    .map(|p| Arc::new(p) as Arc<dyn PaymentProvider>),
            };

            match built {
                Ok(adapter) => {
                    info!(provider = %provider, "payment provider registered");
                    registry.register(adapter);
                }
                Err(PaymentError::ValidationError { message, .. }) => {
                    warn!(provider = %provider, reason = %message, "payment provider not configured, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        if registry.providers.is_empty() {
            return Err(PaymentError::ValidationError {
                message: "no payment provider could be configured".to_string(),
                field: Some("ENABLED_PAYMENT_PROVIDERS".to_string()),
            });
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.name(), provider);
    }

    pub fn with_provider(mut self, provider: Arc<dyn PaymentProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, provider: ProviderName) -> PaymentResult<Arc<dyn PaymentProvider>> {
        self.providers
            .get(&provider)
            .cloned()
            .ok_or_else(|| PaymentError::ValidationError {
                message: format!("provider {} is disabled", provider),
                field: Some("provider".to_string()),
            })
    }

    pub fn list_available_providers(&self) -> Vec<ProviderName> {
        let mut providers: Vec<ProviderName> = self.providers.keys().copied().collect();
        providers.sort_by_key(|p| p.as_str());
        providers
    }
}
