//! Redis-backed shared state.
//!
//! Holds provider OAuth tokens so several instances share one token per
//! provider instead of each fetching its own. Redis being down degrades to a
//! token fetch per request; it never fails a payment on its own.

pub mod error;

use crate::payments::token_cache::{CachedToken, TokenCache};
use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use chrono::Utc;
use error::{CacheError, CacheResult};
use std::time::Duration;
use tracing::{error, info, warn};

pub type RedisPool = Pool<RedisConnectionManager>;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
    pub min_idle: u32,
    pub connection_timeout: Duration,
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            max_connections: 10,
            min_idle: 1,
            connection_timeout: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Initialize Redis connection pool with fault tolerance
pub async fn init_cache_pool(config: CacheConfig) -> Result<RedisPool, CacheError> {
    info!(
        "Initializing Redis cache pool: max_connections={}",
        config.max_connections
    );

    let manager = RedisConnectionManager::new(config.redis_url.clone()).map_err(|e| {
        error!("Failed to create Redis connection manager: {}", e);
        CacheError::ConnectionError(e.to_string())
    })?;

    let pool = Pool::builder()
        .max_size(config.max_connections)
        .min_idle(config.min_idle)
        .connection_timeout(config.connection_timeout)
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .test_on_check_out(false)
        .build(manager)
        .await
        .map_err(|e| {
            error!("Failed to build Redis connection pool: {}", e);
            CacheError::ConnectionError(e.to_string())
        })?;

    if let Err(e) = health_check(&pool).await {
        warn!("Initial Redis connection test failed, but continuing: {}", e);
    }

    info!("Redis cache pool initialized successfully");
    Ok(pool)
}

pub async fn health_check(pool: &RedisPool) -> CacheResult<()> {
    let mut conn = pool.get().await?;
    let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
    Ok(())
}

/// Token cache shared through Redis. Entries expire with the token.
#[derive(Clone)]
pub struct RedisTokenCache {
    pool: RedisPool,
}

impl RedisTokenCache {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }

    async fn try_get(&self, key: &str) -> CacheResult<Option<CachedToken>> {
        let mut conn = self.pool.get().await?;
        let raw: Option<String> = redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
        Ok(match raw {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        })
    }

    async fn try_put(&self, key: &str, token: &CachedToken) -> CacheResult<()> {
        let ttl = (token.expires_at - Utc::now()).num_seconds();
        if ttl <= 0 {
            return Ok(());
        }
        let payload = serde_json::to_string(token)?;
        let mut conn = self.pool.get().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(payload)
            .arg("EX")
            .arg(ttl)
            .query_async(&mut *conn)
            .await?;
        Ok(())
    }

    async fn try_invalidate(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.pool.get().await?;
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut *conn).await?;
        Ok(())
    }
}

#[async_trait]
impl TokenCache for RedisTokenCache {
    async fn get(&self, key: &str) -> Option<CachedToken> {
        match self.try_get(key).await {
            Ok(token) => token,
            Err(e) => {
                warn!(key = %key, error = %e, "token cache read failed");
                None
            }
        }
    }

    async fn put(&self, key: &str, token: CachedToken) {
        if let Err(e) = self.try_put(key, &token).await {
            warn!(key = %key, error = %e, "token cache write failed");
        }
    }

    async fn invalidate(&self, key: &str) {
        if let Err(e) = self.try_invalidate(key).await {
            warn!(key = %key, error = %e, "token cache invalidation failed");
        }
    }
}
