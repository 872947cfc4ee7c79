//! Background timeout sweep
//!
//! Enforces the confirmation window without ever blocking a request: on each
//! tick it expires overdue attempts and retries settlements that failed after a
//! successful payment.

use crate::payments::coordinator::PaymentConfirmationCoordinator;
use crate::payments::types::AttemptState;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub batch_size: i64,
    /// Completed attempts younger than this are left to the request that resolved them
    pub settle_grace: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 100,
            settle_grace: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub settled: usize,
    pub errors: usize,
}

pub struct TimeoutSweeper {
    coordinator: Arc<PaymentConfirmationCoordinator>,
    config: SweeperConfig,
}

impl TimeoutSweeper {
    pub fn new(coordinator: Arc<PaymentConfirmationCoordinator>, config: SweeperConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Run one pass over overdue and unsettled attempts
    pub async fn sweep_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.coordinator.now();
        let store = self.coordinator.attempts();

        match store.find_expired(now, self.config.batch_size).await {
            Ok(overdue) => {
                for attempt in overdue {
                    match self.coordinator.expire(attempt.attempt_id).await {
                        Ok(AttemptState::TimedOut) => report.expired += 1,
                        Ok(_) => {}
                        Err(e) => {
                            report.errors += 1;
                            warn!(attempt_id = %attempt.attempt_id, error = %e, "Failed to expire attempt");
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                error!(error = %e, "Failed to load overdue attempts");
            }
        }

        let grace = chrono::Duration::seconds(self.config.settle_grace.as_secs() as i64);
        match store.find_unsettled(now - grace, self.config.batch_size).await {
            Ok(unsettled) => {
                for attempt in unsettled {
                    match self.coordinator.settle(attempt.attempt_id).await {
                        Ok(true) => report.settled += 1,
                        Ok(false) => {}
                        Err(e) => {
                            report.errors += 1;
                            warn!(attempt_id = %attempt.attempt_id, error = %e, "Failed to settle attempt");
                        }
                    }
                }
            }
            Err(e) => {
                report.errors += 1;
                error!(error = %e, "Failed to load unsettled attempts");
            }
        }

        report
    }

    /// Tick until `shutdown` flips to `true` or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting payment timeout sweeper: interval={:?}, batch_size={}",
            self.config.interval, self.config.batch_size
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep_once().await;
                    if report != SweepReport::default() {
                        info!(
                            expired = report.expired,
                            settled = report.settled,
                            errors = report.errors,
                            "Payment sweep finished"
                        );
                    } else {
                        debug!("Payment sweep found nothing to do");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Stopping payment timeout sweeper");
                        break;
                    }
                }
            }
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
