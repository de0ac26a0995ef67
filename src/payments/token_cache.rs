//! OAuth bearer token caching for providers that authenticate with short-lived
//! tokens (PesaPal, Airtel Money).
//!
//! Each adapter receives an `Arc<dyn TokenCache>` at construction. The
//! in-memory cache suits a single instance; `cache::RedisTokenCache` shares
//! tokens between instances.

use crate::payments::error::PaymentResult;
use crate::payments::types::ProviderName;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    pub fn new(access_token: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_at,
        }
    }

    /// A token is refreshed once `now >= expires_at - safety_margin`.
    pub fn is_usable_at(&self, now: DateTime<Utc>, safety_margin: Duration) -> bool {
        now < self.expires_at - safety_margin
    }
}

pub fn token_cache_key(provider: ProviderName) -> String {
    format!("oauth_token:{}", provider.as_str())
}

#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<CachedToken>;

    async fn put(&self, key: &str, token: CachedToken);

    async fn invalidate(&self, key: &str);
}

#[derive(Default)]
pub struct InMemoryTokenCache {
    tokens: RwLock<HashMap<String, CachedToken>>,
}

impl InMemoryTokenCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenCache for InMemoryTokenCache {
    async fn get(&self, key: &str) -> Option<CachedToken> {
        self.tokens.read().await.get(key).cloned()
    }

    async fn put(&self, key: &str, token: CachedToken) {
        self.tokens.write().await.insert(key.to_string(), token);
    }

    async fn invalidate(&self, key: &str) {
        self.tokens.write().await.remove(key);
    }
}

/// Hands out a valid bearer token, fetching a new one at most once at a time.
pub struct BearerTokenSource {
    cache: Arc<dyn TokenCache>,
    key: String,
    safety_margin: Duration,
    refresh_lock: Mutex<()>,
}

impl BearerTokenSource {
    pub fn new(cache: Arc<dyn TokenCache>, provider: ProviderName, safety_margin: Duration) -> Self {
        Self {
            cache,
            key: token_cache_key(provider),
            safety_margin,
            refresh_lock: Mutex::new(()),
        }
    }

    pub async fn bearer<F, Fut>(&self, fetch: F) -> PaymentResult<String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PaymentResult<CachedToken>>,
    {
        if let Some(token) = self.usable_token().await {
            return Ok(token);
        }

        let _guard = self.refresh_lock.lock().await;
        // Another caller may have refreshed while we waited.
        if let Some(token) = self.usable_token().await {
            return Ok(token);
        }

        let token = fetch().await?;
        debug!(key = %self.key, expires_at = %token.expires_at, "oauth token refreshed");
        let access_token = token.access_token.clone();
        self.cache.put(&self.key, token).await;
        Ok(access_token)
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate(&self.key).await;
    }

    async fn usable_token(&self) -> Option<String> {
        self.cache
            .get(&self.key)
            .await
            .filter(|t| t.is_usable_at(Utc::now(), self.safety_margin))
            .map(|t| t.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn token_is_refreshed_inside_safety_margin() {
        let now = Utc::now();
        let token = CachedToken::new("t", now + Duration::minutes(5));
        assert!(token.is_usable_at(now, Duration::minutes(1)));
        assert!(token.is_usable_at(now + Duration::minutes(3), Duration::minutes(1)));
        assert!(!token.is_usable_at(now + Duration::minutes(4), Duration::minutes(1)));
        assert!(!token.is_usable_at(now, Duration::minutes(5)));
    }

    #[tokio::test]
    async fn cached_token_is_reused() {
        let cache: Arc<dyn TokenCache> = Arc::new(InMemoryTokenCache::new());
        let source = BearerTokenSource::new(cache, ProviderName::Pesapal, Duration::minutes(1));
        let fetches = AtomicUsize::new(0);

        for _ in 0..3 {
            let token = source
                .bearer(|| async {
                    fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(CachedToken::new("abc", Utc::now() + Duration::minutes(5)))
                })
                .await
                .expect("token fetch should succeed");
            assert_eq!(token, "abc");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn nearly_expired_token_triggers_refresh() {
        let cache: Arc<dyn TokenCache> = Arc::new(InMemoryTokenCache::new());
        cache
            .put(
                &token_cache_key(ProviderName::AirtelMoney),
                CachedToken::new("old", Utc::now() + Duration::minutes(4)),
            )
            .await;
        let source =
            BearerTokenSource::new(cache, ProviderName::AirtelMoney, Duration::minutes(5));

        let token = source
            .bearer(|| async { Ok(CachedToken::new("new", Utc::now() + Duration::hours(1))) })
            .await
            .expect("token fetch should succeed");
        assert_eq!(token, "new");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let cache: Arc<dyn TokenCache> = Arc::new(InMemoryTokenCache::new());
        let source = Arc::new(BearerTokenSource::new(
            cache,
            ProviderName::Pesapal,
            Duration::minutes(1),
        ));
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let source = source.clone();
            let fetches = fetches.clone();
            handles.push(tokio::spawn(async move {
                source
                    .bearer(|| async move {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(CachedToken::new("shared", Utc::now() + Duration::minutes(5)))
                    })
                    .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "shared");
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }
}
