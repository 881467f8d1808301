//! Scheduler - one tokio task per poller, each on its own interval.
//!
//! A slow chain call only delays the poller that made it. Every pass checks
//! the emergency stop first and skips while it is set. Errors are logged by
//! kind and the next tick tries again.

use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{CustodyError, CustodyResult, ErrorKind};
use crate::pool::AddressPool;
use crate::runtime::{EmergencyStop, Shutdown};
use crate::scanner::DepositScanner;
use crate::sweep::SweepOrchestrator;
use crate::withdrawal::{WithdrawalProcessor, WithdrawalQueue, WithdrawalService};

/// Withdrawals handled per queue-drain tick.
const DRAIN_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Job {
    Scan,
    Sweep,
    SweepConfirm,
    GasConfirm,
    QueueDrain,
    DelayedPromotion,
    WithdrawalConfirm,
    PoolReplenish,
    StuckRecovery,
}

impl Job {
    pub const ALL: [Job; 9] = [
        Job::Scan,
        Job::Sweep,
        Job::SweepConfirm,
        Job::GasConfirm,
        Job::QueueDrain,
        Job::DelayedPromotion,
        Job::WithdrawalConfirm,
        Job::PoolReplenish,
        Job::StuckRecovery,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Job::Scan => "deposit_scan",
            Job::Sweep => "sweep",
            Job::SweepConfirm => "sweep_confirm",
            Job::GasConfirm => "gas_confirm",
            Job::QueueDrain => "queue_drain",
            Job::DelayedPromotion => "delayed_promotion",
            Job::WithdrawalConfirm => "withdrawal_confirm",
            Job::PoolReplenish => "pool_replenish",
            Job::StuckRecovery => "stuck_recovery",
        }
    }

    pub fn period(self, config: &SchedulerConfig) -> Duration {
        match self {
            Job::Scan => config.scan,
            Job::Sweep => config.sweep,
            Job::SweepConfirm => config.sweep_confirm,
            Job::GasConfirm => config.gas_confirm,
            Job::QueueDrain => config.queue_drain,
            Job::DelayedPromotion => config.delayed_promotion,
            Job::WithdrawalConfirm => config.withdrawal_confirm,
            Job::PoolReplenish => config.pool_replenish,
            Job::StuckRecovery => config.stuck_recovery,
        }
    }
}

/// Typed handles to everything the pollers drive.
#[derive(Clone)]
pub struct Pollers {
    pub pool: Arc<AddressPool>,
    pub scanner: Arc<DepositScanner>,
    pub sweeper: Arc<SweepOrchestrator>,
    pub queue: Arc<WithdrawalQueue>,
    pub withdrawals: Arc<WithdrawalService>,
    pub processor: Arc<WithdrawalProcessor>,
    pub stop: EmergencyStop,
}

impl Pollers {
    /// One pass of `job`. `Ok(false)` when skipped for the emergency stop.
    pub async fn run_once(&self, job: Job) -> CustodyResult<bool> {
        if self.stop.is_active().await {
            debug!(job = job.name(), "emergency stop active, skipping pass");
            return Ok(false);
        }
        match job {
            Job::Scan => {
                self.scanner.scan().await?;
            }
            Job::Sweep => {
                self.sweeper.sweep_pending().await?;
            }
            Job::SweepConfirm => {
                self.sweeper.confirm_sweeps().await?;
            }
            Job::GasConfirm => {
                self.sweeper.confirm_gas_topups().await?;
            }
            Job::QueueDrain => {
                self.processor.drain(DRAIN_LIMIT).await?;
            }
            Job::DelayedPromotion => {
                self.queue.promote_due().await?;
            }
            Job::WithdrawalConfirm => {
                self.processor.confirm_sent().await?;
            }
            Job::PoolReplenish => {
                self.pool.replenish().await?;
            }
            Job::StuckRecovery => {
                self.processor.reconcile().await?;
                self.withdrawals.recover_stuck().await?;
            }
        }
        Ok(true)
    }
}

pub struct Scheduler {
    pollers: Pollers,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(pollers: Pollers, config: SchedulerConfig) -> Self { Self { pollers, config } }

    /// Run one pass inline, outside the timers.
    pub async fn run_once(&self, job: Job) -> CustodyResult<bool> { self.pollers.run_once(job).await }

    /// Spawn every poller. Each task exits on the shutdown signal.
    pub fn spawn(&self, shutdown: &Shutdown) -> Vec<JoinHandle<()>> {
        Job::ALL.iter().map(|&job| self.spawn_job(job, shutdown)).collect()
    }

    fn spawn_job(&self, job: Job, shutdown: &Shutdown) -> JoinHandle<()> {
        let pollers = self.pollers.clone();
        let period = job.period(&self.config);
        let mut shutdown = shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(job = job.name(), period_secs = period.as_secs_f64(), "poller started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        info!(job = job.name(), "poller stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = pollers.run_once(job).await {
                            log_failure(job, &e);
                        }
                    }
                }
            }
        })
    }
}

fn log_failure(job: Job, e: &CustodyError) {
    match e.kind() {
        ErrorKind::Transient => warn!(job = job.name(), error = %e, "pass failed, retrying next tick"),
        ErrorKind::ChainRejected | ErrorKind::Validation => warn!(job = job.name(), error = %e, "pass failed"),
        ErrorKind::Invariant => error!(job = job.name(), error = %e, "pass aborted on invariant violation"),
    }
}
