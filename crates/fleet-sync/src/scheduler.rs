//! # Push Scheduler
//!
//! Periodically decides which devices should be woken up and spreads their
//! pushes across a delay window.
//!
//! ## Cycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  interval tick                                                          │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  admission gate (1 permit) ── busy ──► skip this tick                   │
//! │      │ acquired                                                         │
//! │      ▼                                                                  │
//! │  load devices ──► PushDecision::evaluate ──► eligible list              │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  quota = ceil(eligible / (window - 1)) per 500 ms tick                  │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  PushTaskQueue::submit(udid, unique_for) ──► workers ──► push_device    │
//! │      │                                                                  │
//! │      ▼                                                                  │
//! │  housekeeping (orphans, stale unlock PINs)                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each push carries an expiry of `now + window`, which is also stored as
//! the device's next push time so it is left alone until the window passes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commands::CommandDispatcher;
use crate::config::SchedulerSettings;
use crate::error::{SyncError, SyncResult};
use crate::tasks::{PushHandler, PushTaskQueue};
use fleet_core::schedule::{dispatch_quota, THROTTLE_TICK_MS};
use fleet_core::PushDecision;
use fleet_db::{Database, HousekeepingReport};

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleStats {
    pub started_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    /// Active devices evaluated.
    pub devices: usize,
    /// Devices with a future schedule.
    pub scheduled: usize,
    pub missing_info: usize,
    pub stale_info: usize,
    /// Eligible through the fallback branch.
    pub fallback: usize,
    pub submitted: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub housekeeping: HousekeepingReport,
}

impl CycleStats {
    pub fn eligible(&self) -> usize {
        self.missing_info + self.stale_info + self.fallback
    }
}

// =============================================================================
// Scheduler
// =============================================================================

pub struct PushScheduler {
    db: Database,
    dispatcher: Option<Arc<dyn CommandDispatcher>>,
    tasks: PushTaskQueue,
    settings: SchedulerSettings,
    ready: Arc<AtomicBool>,
    gate: Arc<Semaphore>,
    last_cycle: RwLock<Option<CycleStats>>,
}

impl PushScheduler {
    /// `ready` is raised by the enrollment refresh once the device table has
    /// been populated.
    pub fn new(
        db: Database,
        dispatcher: Option<Arc<dyn CommandDispatcher>>,
        tasks: PushTaskQueue,
        settings: SchedulerSettings,
        ready: Arc<AtomicBool>,
    ) -> Self {
        PushScheduler {
            db,
            dispatcher,
            tasks,
            settings,
            ready,
            gate: Arc::new(Semaphore::new(1)),
            last_cycle: RwLock::new(None),
        }
    }

    pub async fn last_cycle(&self) -> Option<CycleStats> {
        self.last_cycle.read().await.clone()
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.settings.delay_window_secs)
    }

    // =========================================================================
    // Loop
    // =========================================================================

    /// Polls the readiness flag up to `startup_poll_attempts` times.
    ///
    /// Returns whether the flag was seen raised; the caller proceeds either
    /// way unless cancelled.
    pub async fn wait_for_enrollment(&self, cancel: &CancellationToken) -> bool {
        let poll = Duration::from_secs(self.settings.startup_poll_interval_secs);

        for attempt in 1..=self.settings.startup_poll_attempts {
            if self.ready.load(Ordering::Acquire) {
                return true;
            }
            debug!(attempt, "Waiting for first enrollment refresh");

            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(poll) => {}
            }
        }

        let ready = self.ready.load(Ordering::Acquire);
        if !ready {
            warn!(
                attempts = self.settings.startup_poll_attempts,
                "Enrollment refresh not finished; scheduling with the current device table"
            );
        }
        ready
    }

    /// Runs cycles on every interval tick until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.wait_for_enrollment(&cancel).await;
        if cancel.is_cancelled() {
            return;
        }

        info!(
            interval_secs = self.settings.interval_secs,
            window_secs = self.settings.delay_window_secs,
            debug = self.settings.debug,
            "Push scheduler started"
        );

        let mut ticker = interval(Duration::from_secs(self.settings.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cycles = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.gate.clone().try_acquire_owned() {
                        Ok(permit) => {
                            let scheduler = self.clone();
                            let cancel = cancel.clone();
                            cycles.spawn(async move {
                                let _permit = permit;
                                if let Err(err) = scheduler.run_cycle(&cancel).await {
                                    error!(error = %err, "Push cycle failed");
                                }
                            });
                        }
                        Err(_) => debug!("Previous push cycle still running; skipping tick"),
                    }
                }
            }

            while cycles.try_join_next().is_some() {}
        }

        while cycles.join_next().await.is_some() {}
        info!("Push scheduler stopped");
    }

    /// Runs one cycle unless another is in progress.
    pub async fn try_cycle(&self, cancel: &CancellationToken) -> SyncResult<Option<CycleStats>> {
        let Ok(_permit) = self.gate.clone().try_acquire_owned() else {
            debug!("Push cycle already running");
            return Ok(None);
        };
        self.run_cycle(cancel).await.map(Some)
    }

    // =========================================================================
    // Cycle
    // =========================================================================

    async fn run_cycle(&self, cancel: &CancellationToken) -> SyncResult<CycleStats> {
        let started_at = Utc::now();
        let clock = tokio::time::Instant::now();
        let mut stats = CycleStats {
            started_at: Some(started_at),
            ..Default::default()
        };

        let devices = self.db.devices().list_all().await?;
        let mut eligible = Vec::new();
        for device in devices.iter().filter(|d| d.active) {
            stats.devices += 1;
            let decision = PushDecision::evaluate(device, started_at);
            match decision {
                PushDecision::Scheduled => stats.scheduled += 1,
                PushDecision::MissingInfo => stats.missing_info += 1,
                PushDecision::StaleInfo => stats.stale_info += 1,
                PushDecision::Default => stats.fallback += 1,
            }
            if decision.needs_push() {
                eligible.push(device.udid.as_str());
            }
        }

        let quota = dispatch_quota(eligible.len(), self.settings.delay_window_secs);
        let unique_for = self.settings.unique_for();
        debug!(
            devices = stats.devices,
            eligible = eligible.len(),
            quota,
            "Dispatching pushes"
        );

        for (index, udid) in eligible.iter().enumerate() {
            if index > 0 && index % quota == 0 {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(THROTTLE_TICK_MS)) => {}
                }
            }

            let submitted = tokio::select! {
                _ = cancel.cancelled() => break,
                submitted = self.tasks.submit(udid, unique_for) => submitted,
            };

            match submitted {
                Ok(()) => stats.submitted += 1,
                Err(SyncError::Duplicate(_)) => {
                    stats.duplicates += 1;
                    debug!(udid = %udid, "Push already queued");
                }
                Err(err) => {
                    stats.failed += 1;
                    error!(udid = %udid, error = %err, "Failed to queue push");
                }
            }
        }

        match self.db.housekeeping().run(Utc::now()).await {
            Ok(report) => stats.housekeeping = report,
            Err(err) => error!(error = %err, "Housekeeping failed"),
        }

        stats.duration_ms = clock.elapsed().as_millis() as u64;
        info!(
            devices = stats.devices,
            eligible = stats.eligible(),
            submitted = stats.submitted,
            duplicates = stats.duplicates,
            failed = stats.failed,
            cleaned = stats.housekeeping.total(),
            duration_ms = stats.duration_ms,
            "Push cycle complete"
        );

        *self.last_cycle.write().await = Some(stats.clone());
        Ok(stats)
    }

    // =========================================================================
    // Push
    // =========================================================================

    /// Wakes one device with an expiry of `now + window`, recording the
    /// expiry as the device's next push time.
    pub async fn push_device(&self, udid: &str) -> SyncResult<()> {
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or(SyncError::ClientNotInitialized)?;

        let window = chrono::Duration::from_std(self.window())
            .map_err(|err| SyncError::InvalidConfig(err.to_string()))?;
        let expiry = Utc::now() + window;
        self.db.devices().set_next_push(udid, Some(expiry)).await?;

        // next_push stays at the expiry even when the wake fails, so the
        // device waits out the window before the scheduler retries it.
        let result = match dispatcher.push(&[udid.to_string()], Some(expiry)).await {
            Ok(result) => result,
            Err(err) => {
                debug!(udid, %expiry, "Push failed, device deferred until next push");
                return Err(err);
            }
        };
        if let Some(push_error) = result.push_error_for(udid) {
            warn!(udid, error = %push_error, "Push rejected");
            debug!(udid, %expiry, "Push rejected, device deferred until next push");
        } else {
            debug!(udid, %expiry, "Push sent");
        }
        Ok(())
    }
}

#[async_trait]
impl PushHandler for PushScheduler {
    async fn handle(&self, udid: String) {
        if let Err(err) = self.push_device(&udid).await {
            error!(udid = %udid, error = %err, "Push failed");
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
