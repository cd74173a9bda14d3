//! Periodic sync: run a full Apply cycle on start, then once per `sync_interval`.
//!
//! The next sleep starts after the cycle finishes, so cycles never overlap. Each tick
//! also evicts expired login rate-limit entries.

use crate::domain::DomainError;
use crate::shared::SharedSettings;
use crate::usecases::rate_limiter::LoginRateLimiter;
use crate::usecases::reconciler::{Reconciler, SyncMode};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};

pub struct SyncScheduler {
    reconciler: Arc<Reconciler>,
    limiter: Arc<LoginRateLimiter>,
    settings: SharedSettings,
    shutdown: watch::Receiver<bool>,
}

impl SyncScheduler {
    pub fn new(
        reconciler: Arc<Reconciler>,
        limiter: Arc<LoginRateLimiter>,
        settings: SharedSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            reconciler,
            limiter,
            settings,
            shutdown,
        }
    }

    /// One tick: full sync, then limiter sweep.
    pub async fn tick(&self) {
        match self.reconciler.run_sync(SyncMode::Apply).await {
            Ok(report) => {
                if !report.failed_mappings.is_empty() {
                    error!(
                        failed = report.failed_mappings.len(),
                        "scheduled sync finished with failed mappings"
                    );
                }
            }
            Err(DomainError::SyncAlreadyRunning) => {
                debug!("sync already running; skipping scheduled cycle");
            }
            Err(e) => error!(error = %e, "scheduled sync failed"),
        }

        let settings = self.settings.current();
        let evicted = self
            .limiter
            .sweep(Utc::now().timestamp_millis(), settings.login_error_timeout_ms);
        if evicted > 0 {
            debug!(evicted, "expired login rate-limit entries removed");
        }
    }

    /// Run until the shutdown signal flips.
    pub async fn run(mut self) {
        info!(
            interval_secs = self.settings.current().sync_interval.as_secs(),
            "sync scheduler started"
        );
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            self.tick().await;

            let interval = self.settings.current().sync_interval;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("sync scheduler stopped");
    }
}
