use crate::services::reconciliation::{ReconciliationCoordinator, ReconciliationError, SweepReport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct PendingExpiryConfig {
    /// How often the worker wakes up to sweep.
    pub sweep_interval: Duration,
    /// Pending payments older than this get a final provider query and then
    /// expire.
    pub pending_expiry: chrono::Duration,
    /// Maximum number of payments handled per sweep.
    pub batch_size: i64,
}

impl Default for PendingExpiryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(900),
            pending_expiry: chrono::Duration::hours(24),
            batch_size: 100,
        }
    }
}

impl PendingExpiryConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.sweep_interval = Duration::from_secs(
            std::env::var("PENDING_SWEEP_INTERVAL_SECONDS")
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(cfg.sweep_interval.as_secs()),
        );
        cfg.pending_expiry = std::env::var("PENDING_EXPIRY_HOURS")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .map(chrono::Duration::hours)
            .unwrap_or(cfg.pending_expiry);
        cfg.batch_size = std::env::var("PENDING_SWEEP_BATCH_SIZE")
            .ok()
            .and_then(|v| v.parse::<i64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(cfg.batch_size);
        cfg
    }
}

/// Expires abandoned checkouts so payments do not stay pending forever.
pub struct PendingExpiryWorker {
    coordinator: Arc<ReconciliationCoordinator>,
    config: PendingExpiryConfig,
}

impl PendingExpiryWorker {
    pub fn new(coordinator: Arc<ReconciliationCoordinator>, config: PendingExpiryConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            pending_expiry_hours = self.config.pending_expiry.num_hours(),
            batch_size = self.config.batch_size,
            "pending payment expiry worker started"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("pending payment expiry worker stopping");
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.sweep_interval) => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "pending payment sweep failed");
                    }
                }
            }
        }

        info!("pending payment expiry worker stopped");
    }

    pub async fn run_once(&self) -> Result<SweepReport, ReconciliationError> {
        let cutoff = Utc::now() - self.config.pending_expiry;
        self.coordinator
            .sweep_stale_pending(cutoff, self.config.batch_size)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_expiry_is_one_day() {
        let cfg = PendingExpiryConfig::default();
        assert_eq!(cfg.pending_expiry.num_hours(), 24);
        assert_eq!(cfg.batch_size, 100);
    }
}
