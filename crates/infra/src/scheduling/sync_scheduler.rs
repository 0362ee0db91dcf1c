//! Periodic sync scheduler.
//!
//! Triggers a sync of every registered source on a fixed interval and renews
//! push-notification channels on a slower one. Both only run while the
//! device is online; a missed tick is delayed rather than bursted.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use calsync_domain::ConnectivityState;
//! use calsync_infra::scheduling::{PeriodicSync, SyncScheduler, SyncSchedulerConfig};
//! use tokio::sync::watch;
//!
//! # async fn example(driver: Arc<dyn PeriodicSync>) -> Result<(), Box<dyn std::error::Error>> {
//! let (_tx, connectivity) = watch::channel(ConnectivityState::Online);
//! let mut scheduler = SyncScheduler::new(
//!     driver,
//!     connectivity,
//!     SyncSchedulerConfig { interval: Duration::from_secs(300), ..Default::default() },
//! );
//!
//! scheduler.start()?;
//! // ... application runs ...
//! scheduler.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use calsync_domain::{ConnectivityState, SyncConfig};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::scheduling::error::{SchedulerError, SchedulerResult};
use crate::sync::SyncOrchestrator;

/// Shortest period accepted for either timer
const MIN_PERIOD: Duration = Duration::from_millis(10);

/// What the scheduler drives on each tick
#[async_trait]
pub trait PeriodicSync: Send + Sync {
    /// Start a sync of every source; must not block on the passes
    fn trigger_all(&self);

    /// Renew push-notification channels
    async fn renew_push_subscriptions(&self);
}

#[async_trait]
impl PeriodicSync for SyncOrchestrator {
    fn trigger_all(&self) {
        let run = SyncOrchestrator::trigger_all(self);
        debug!(%run, "periodic sync triggered");
    }

    async fn renew_push_subscriptions(&self) {
        let renewed = SyncOrchestrator::renew_push_subscriptions(self).await;
        debug!(renewed = renewed.len(), "push subscriptions renewed");
    }
}

/// Scheduler timing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSchedulerConfig {
    /// Period between sync triggers
    pub interval: Duration,
    /// Period between push-channel renewals
    pub push_renewal_interval: Duration,
    /// Join timeout when stopping
    pub join_timeout: Duration,
}

impl Default for SyncSchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            push_renewal_interval: Duration::from_secs(6 * 60 * 60),
            join_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&SyncConfig> for SyncSchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            interval: config.interval(),
            push_renewal_interval: config.push_renewal_interval(),
            ..Self::default()
        }
    }
}

/// Interval-based trigger for periodic sync and push renewal
pub struct SyncScheduler {
    driver: Arc<dyn PeriodicSync>,
    connectivity: watch::Receiver<ConnectivityState>,
    config: SyncSchedulerConfig,
    cancellation_token: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl SyncScheduler {
    pub fn new(
        driver: Arc<dyn PeriodicSync>,
        connectivity: watch::Receiver<ConnectivityState>,
        config: SyncSchedulerConfig,
    ) -> Self {
        Self {
            driver,
            connectivity,
            config,
            cancellation_token: CancellationToken::new(),
            task_handle: None,
        }
    }

    /// Start the scheduler loop
    #[instrument(skip(self))]
    pub fn start(&mut self) -> SchedulerResult<()> {
        if self.is_running() {
            return Err(SchedulerError::AlreadyRunning);
        }

        info!(
            interval = ?self.config.interval,
            push_renewal_interval = ?self.config.push_renewal_interval,
            "Starting sync scheduler"
        );

        // Fresh token so the scheduler can restart after stop
        self.cancellation_token = CancellationToken::new();

        let driver = Arc::clone(&self.driver);
        let connectivity = self.connectivity.clone();
        let config = self.config.clone();
        let cancel = self.cancellation_token.clone();
        self.task_handle = Some(tokio::spawn(async move {
            Self::schedule_loop(driver, connectivity, config, cancel).await;
        }));

        info!("Sync scheduler started");
        Ok(())
    }

    /// Stop the scheduler and wait for the loop to exit
    #[instrument(skip(self))]
    pub async fn stop(&mut self) -> SchedulerResult<()> {
        let Some(handle) = self.task_handle.take() else {
            return Err(SchedulerError::NotRunning);
        };

        info!("Stopping sync scheduler");
        self.cancellation_token.cancel();

        let join_timeout = self.config.join_timeout;
        tokio::time::timeout(join_timeout, handle)
            .await
            .map_err(|source| SchedulerError::Timeout { duration: join_timeout, source })??;

        info!("Sync scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.task_handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    async fn schedule_loop(
        driver: Arc<dyn PeriodicSync>,
        connectivity: watch::Receiver<ConnectivityState>,
        config: SyncSchedulerConfig,
        cancel: CancellationToken,
    ) {
        let sync_period = config.interval.max(MIN_PERIOD);
        let mut sync_tick = tokio::time::interval_at(Instant::now() + sync_period, sync_period);
        sync_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // First renewal fires immediately
        let mut renew_tick = tokio::time::interval(config.push_renewal_interval.max(MIN_PERIOD));
        renew_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("Sync scheduler loop cancelled");
                    break;
                }
                _ = sync_tick.tick() => {
                    if connectivity.borrow().is_online() {
                        driver.trigger_all();
                    } else {
                        debug!("offline, skipping periodic sync");
                    }
                }
                _ = renew_tick.tick() => {
                    if !connectivity.borrow().is_online() {
                        continue;
                    }
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = driver.renew_push_subscriptions() => {}
                    }
                }
            }
        }
    }
}

/// Ensure the loop is cancelled when dropped
impl Drop for SyncScheduler {
    fn drop(&mut self) {
        if self.is_running() {
            warn!("SyncScheduler dropped while running; cancelling");
            self.cancellation_token.cancel();
        }
    }
}
