use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use streamflix_backend::api::{build_router, AppState};
use streamflix_backend::config::AppConfig;
use streamflix_backend::database::memory::{InMemoryPaymentStore, InMemoryUserStore};
use streamflix_backend::database::payment_repository::PaymentStore;
use streamflix_backend::database::user_repository::UserStore;
use streamflix_backend::health::HealthChecker;
use streamflix_backend::logging::init_tracing;
use streamflix_backend::payments::factory::ProviderRegistry;
use streamflix_backend::payments::pricing::PricingTable;
use streamflix_backend::payments::token_cache::{InMemoryTokenCache, TokenCache};
use streamflix_backend::services::{
    LogNotifier, PaymentLedger, ReconciliationCoordinator, SubscriptionExtender,
};
use streamflix_backend::workers::pending_expiry::{PendingExpiryConfig, PendingExpiryWorker};
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

type Stores = (Arc<dyn PaymentStore>, Arc<dyn UserStore>);

fn in_memory_stores() -> Stores {
    (
        Arc::new(InMemoryPaymentStore::new()),
        Arc::new(InMemoryUserStore::new()),
    )
}

#[cfg(feature = "database")]
async fn build_stores(
    config: &AppConfig,
    health_checker: HealthChecker,
) -> anyhow::Result<(Stores, HealthChecker)> {
    use streamflix_backend::database::init_pool_from_config;
    use streamflix_backend::database::payment_repository::PaymentRepository;
    use streamflix_backend::database::user_repository::UserRepository;

    let Some(db_config) = &config.database else {
        warn!("No database configured, payments are kept in memory only");
        return Ok((in_memory_stores(), health_checker));
    };

    let pool = init_pool_from_config(db_config).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied");

    let stores: Stores = (
        Arc::new(PaymentRepository::new(pool.clone())),
        Arc::new(UserRepository::new(pool.clone())),
    );
    Ok((stores, health_checker.with_database(pool)))
}

#[cfg(not(feature = "database"))]
async fn build_stores(
    config: &AppConfig,
    health_checker: HealthChecker,
) -> anyhow::Result<(Stores, HealthChecker)> {
    if config.database.is_some() {
        warn!("Built without the database feature, payments are kept in memory only");
    }
    Ok((in_memory_stores(), health_checker))
}

#[cfg(feature = "cache")]
async fn build_token_cache(
    config: &AppConfig,
    health_checker: HealthChecker,
) -> (Arc<dyn TokenCache>, HealthChecker) {
    use streamflix_backend::cache::{init_cache_pool, CacheConfig, RedisTokenCache};

    let Some(cache_config) = &config.cache else {
        info!("No REDIS_URL set, provider tokens are cached per process");
        return (Arc::new(InMemoryTokenCache::new()), health_checker);
    };

    let pool_config = CacheConfig {
        redis_url: cache_config.redis_url.clone(),
        max_connections: cache_config.max_connections,
        ..CacheConfig::default()
    };
    match init_cache_pool(pool_config).await {
        Ok(pool) => (
            Arc::new(RedisTokenCache::new(pool.clone())),
            health_checker.with_cache(pool),
        ),
        Err(e) => {
            warn!(error = %e, "Redis unavailable, provider tokens are cached per process");
            (Arc::new(InMemoryTokenCache::new()), health_checker)
        }
    }
}

#[cfg(not(feature = "cache"))]
async fn build_token_cache(
    _config: &AppConfig,
    health_checker: HealthChecker,
) -> (Arc<dyn TokenCache>, HealthChecker) {
    (Arc::new(InMemoryTokenCache::new()), health_checker)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        skip_externals = config.skip_externals,
        providers = ?config.payments.enabled_providers,
        "Starting streamflix payments backend"
    );

    let (stores, health_checker) = build_stores(&config, HealthChecker::new()).await?;
    let (payment_store, user_store) = stores;
    let (token_cache, health_checker) = build_token_cache(&config, health_checker).await;

    let registry =
        match ProviderRegistry::from_env(&config.payments.factory_config(), token_cache) {
            Ok(registry) => registry,
            Err(e) if config.skip_externals => {
                warn!(error = %e, "No payment provider configured");
                ProviderRegistry::new()
            }
            Err(e) => return Err(e.into()),
        };
    info!(providers = ?registry.list_available_providers(), "Payment providers ready");

    let ledger = Arc::new(PaymentLedger::new(
        payment_store,
        SubscriptionExtender::new(user_store),
        Arc::new(LogNotifier::new()),
    ));
    let coordinator = Arc::new(ReconciliationCoordinator::new(
        registry,
        ledger,
        PricingTable::default(),
        config.payments.redirect_pages.clone(),
    ));
    coordinator.check_pricing()?;

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let expiry_worker =
        PendingExpiryWorker::new(coordinator.clone(), PendingExpiryConfig::from_env());
    let expiry_handle = tokio::spawn(expiry_worker.run(worker_shutdown_rx));

    let app = build_router(AppState {
        coordinator,
        health_checker,
        admin_token: config.payments.admin_token.clone(),
    });

    let addr: SocketAddr = config.server.bind_address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), expiry_handle)
        .await
        .is_err()
    {
        error!("Timed out waiting for expiry worker shutdown");
    }

    info!("Server shutdown complete");
    Ok(())
}
