//! Health check module
//! Provides health status for the application and its dependencies

use serde::Serialize;
use std::collections::HashMap;
#[cfg(any(feature = "database", feature = "cache"))]
use std::time::{Duration, Instant};
#[cfg(any(feature = "database", feature = "cache"))]
use tokio::time::timeout;
#[cfg(any(feature = "database", feature = "cache"))]
use tracing::{error, info};

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub providers: Vec<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum ComponentState {
    Up,
    Down,
}

impl HealthStatus {
    pub fn new(providers: Vec<String>) -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            providers,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }
}

/// Health checker for the application. Components that are not configured
/// (in-memory runs) are reported but never fail the check.
#[derive(Clone, Default)]
pub struct HealthChecker {
    #[cfg(feature = "database")]
    db_pool: Option<sqlx::PgPool>,
    #[cfg(feature = "cache")]
    cache: Option<crate::cache::RedisPool>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "database")]
    pub fn with_database(mut self, pool: sqlx::PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    #[cfg(feature = "cache")]
    pub fn with_cache(mut self, pool: crate::cache::RedisPool) -> Self {
        self.cache = Some(pool);
        self
    }

    /// Perform comprehensive health check
    pub async fn check_health(&self, providers: Vec<String>) -> HealthStatus {
        #[allow(unused_mut)]
        let mut health_status = HealthStatus::new(providers);
        #[allow(unused_mut)]
        let mut overall_healthy = true;

        #[cfg(feature = "database")]
        match &self.db_pool {
            Some(pool) => {
                let component = timed_check("database", check_database_health(pool)).await;
                overall_healthy &= component.status == ComponentState::Up;
                health_status.checks.insert("database".to_string(), component);
            }
            None => {
                health_status
                    .checks
                    .insert("database".to_string(), in_memory());
            }
        }

        #[cfg(feature = "cache")]
        if let Some(pool) = &self.cache {
            let component = timed_check("cache", check_cache_health(pool)).await;
            overall_healthy &= component.status == ComponentState::Up;
            health_status.checks.insert("cache".to_string(), component);
        }

        health_status.status = if overall_healthy {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        };

        health_status
    }
}

#[cfg(feature = "database")]
fn in_memory() -> ComponentHealth {
    ComponentHealth {
        status: ComponentState::Up,
        response_time_ms: None,
        details: Some("in-memory store".to_string()),
    }
}

#[cfg(any(feature = "database", feature = "cache"))]
async fn timed_check<F>(name: &str, check: F) -> ComponentHealth
where
    F: std::future::Future<Output = Result<(), String>>,
{
    let start = Instant::now();
    match timeout(Duration::from_secs(5), check).await {
        Ok(Ok(())) => {
            let elapsed = start.elapsed().as_millis();
            info!("{} health check: OK ({}ms)", name, elapsed);
            ComponentHealth::up(Some(elapsed))
        }
        Ok(Err(e)) => {
            error!("{} health check failed: {}", name, e);
            ComponentHealth::down(Some(e))
        }
        Err(_) => {
            error!("{} health check timed out", name);
            ComponentHealth::down(Some("Timeout".to_string()))
        }
    }
}

#[cfg(feature = "database")]
async fn check_database_health(pool: &sqlx::PgPool) -> Result<(), String> {
    crate::database::health_check(pool)
        .await
        .map_err(|e| e.to_string())
}

#[cfg(feature = "cache")]
async fn check_cache_health(pool: &crate::cache::RedisPool) -> Result<(), String> {
    crate::cache::health_check(pool)
        .await
        .map_err(|e| e.to_string())
}
