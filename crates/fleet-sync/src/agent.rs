//! # Director Agent
//!
//! Wires the protocol clients, command queue, declaration synchronizer and
//! push scheduler together from a [`DirectorConfig`], and owns the
//! background loops.
//!
//! ## Background Tasks
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           DirectorAgent                                 │
//! │                                                                         │
//! │  ┌──────────────────┐  first pass done  ┌──────────────────────────┐   │
//! │  │ enrollment loop  │ ─── ready flag ──►│ PushScheduler::run       │   │
//! │  │ (refresh_devices)│                   │ interval + admission gate│   │
//! │  └──────────────────┘                   └────────────┬─────────────┘   │
//! │                                                      │ submit          │
//! │  ┌──────────────────┐                   ┌────────────▼─────────────┐   │
//! │  │ maintenance loop │                   │ PushTaskConsumer         │   │
//! │  │ (expire_commands)│                   │ workers → push_device    │   │
//! │  └──────────────────┘                   └──────────────────────────┘   │
//! │                                                                         │
//! │  All four stop when the agent's CancellationToken is cancelled;        │
//! │  in-flight HTTP retries observe child tokens of the same root.         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::commands::{CommandDispatcher, EnqueueClient};
use crate::config::{CommandDialect, DirectorConfig, EnrollmentSettings};
use crate::declarations::DeclarationClient;
use crate::enrollment::{refresh_devices, EnrollmentSource};
use crate::error::SyncResult;
use crate::legacy::LegacyCommandClient;
use crate::queue::{CommandQueue, CounterSnapshot};
use crate::scheduler::{CycleStats, PushScheduler};
use crate::synchronizer::DeclarationSync;
use crate::tasks::{PushTaskConsumer, PushTaskQueue};
use crate::transport::{Endpoint, RetryingTransport};
use fleet_db::Database;

// =============================================================================
// Status
// =============================================================================

/// Snapshot of the agent's background work.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectorStatus {
    pub running: bool,
    pub dialect: Option<CommandDialect>,
    pub declarations_enabled: bool,
    /// The first enrollment refresh has finished (or none is configured).
    pub enrollment_ready: bool,
    pub last_refresh_count: Option<usize>,
    pub last_refresh_at: Option<DateTime<Utc>>,
    pub last_refresh_error: Option<String>,
    pub expired_commands: u64,
    pub last_cycle: Option<CycleStats>,
    pub counters: CounterSnapshot,
}

// =============================================================================
// Agent
// =============================================================================

pub struct DirectorAgent {
    config: Arc<DirectorConfig>,
    db: Database,
    queue: CommandQueue,
    declarations: Option<DeclarationSync>,
    enrollment: Option<Arc<dyn EnrollmentSource>>,
    scheduler: Arc<PushScheduler>,
    consumer: Option<PushTaskConsumer>,
    ready: Arc<AtomicBool>,
    status: Arc<RwLock<DirectorStatus>>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl DirectorAgent {
    /// Builds every client named by the configuration. Servers without a
    /// URL are simply absent: commands then fail with `ClientNotInitialized`.
    pub fn new(config: DirectorConfig, db: Database) -> SyncResult<Self> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let transport = RetryingTransport::with_timeout(
            Duration::from_secs(config.retry.request_timeout_secs),
            config.retry.to_retry_config(),
        )?;

        let mut dispatcher: Option<Arc<dyn CommandDispatcher>> = None;
        let mut enrollment: Option<Arc<dyn EnrollmentSource>> = None;

        if let Some(url) = &config.commands.url {
            let endpoint = Endpoint::new(url, &config.commands.username, &config.commands.api_key)?;
            match config.commands.dialect {
                CommandDialect::Enqueue => {
                    let client = Arc::new(
                        EnqueueClient::new(transport.clone(), endpoint)
                            .with_cancellation(cancel.child_token()),
                    );
                    dispatcher = Some(client.clone());
                    enrollment = Some(client);
                }
                CommandDialect::Legacy => {
                    dispatcher = Some(Arc::new(
                        LegacyCommandClient::new(transport.clone(), endpoint)
                            .with_cancellation(cancel.child_token()),
                    ));
                }
            }
        } else {
            warn!("No command server configured; commands and pushes are disabled");
        }

        let declarations = match &config.declarations.url {
            Some(url) => {
                let endpoint = Endpoint::new(
                    url,
                    &config.declarations.username,
                    &config.declarations.api_key,
                )?;
                let api = DeclarationClient::new(transport, endpoint)
                    .with_cancellation(cancel.child_token());
                Some(DeclarationSync::new(
                    Arc::new(api),
                    db.clone(),
                    &config.declarations.namespace,
                    &config.declarations.profile_base_url,
                ))
            }
            None => None,
        };

        let queue = CommandQueue::new(db.clone(), dispatcher.clone())
            .with_clear_on_enroll(config.queue.clear_on_enroll);

        let (tasks, consumer) =
            PushTaskQueue::new(config.scheduler.queue_capacity, config.scheduler.workers);
        let ready = Arc::new(AtomicBool::new(false));
        let scheduler = Arc::new(PushScheduler::new(
            db.clone(),
            dispatcher.clone(),
            tasks,
            config.scheduler.clone(),
            ready.clone(),
        ));

        let status = DirectorStatus {
            dialect: dispatcher.as_ref().map(|d| d.dialect()),
            declarations_enabled: declarations.is_some(),
            ..Default::default()
        };

        Ok(DirectorAgent {
            config: Arc::new(config),
            db,
            queue,
            declarations,
            enrollment,
            scheduler,
            consumer: Some(consumer),
            ready,
            status: Arc::new(RwLock::new(status)),
            cancel,
            handles: Vec::new(),
        })
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// `None` when no declaration server is configured.
    pub fn declarations(&self) -> Option<&DeclarationSync> {
        self.declarations.as_ref()
    }

    pub fn scheduler(&self) -> &Arc<PushScheduler> {
        &self.scheduler
    }

    pub async fn status(&self) -> DirectorStatus {
        let mut status = self.status.read().await.clone();
        status.enrollment_ready = self.ready.load(Ordering::Acquire);
        status.last_cycle = self.scheduler.last_cycle().await;
        status.counters = self.queue.counters();
        status
    }

    /// Spawns the background loops. Calling it twice is a no-op.
    pub async fn start(&mut self) -> SyncResult<()> {
        let Some(consumer) = self.consumer.take() else {
            warn!("Director agent already started");
            return Ok(());
        };

        let dialect = self.status.read().await.dialect;
        info!(
            ?dialect,
            declarations = self.declarations.is_some(),
            "Starting director agent"
        );

        match self.enrollment.clone() {
            Some(source) => {
                self.handles.push(tokio::spawn(Self::enrollment_loop(
                    self.db.clone(),
                    source,
                    self.config.enrollment.clone(),
                    self.ready.clone(),
                    self.status.clone(),
                    self.cancel.clone(),
                )));
            }
            None => {
                info!("No enrollment source for this dialect; scheduling from the local device table");
                self.ready.store(true, Ordering::Release);
            }
        }

        self.handles.push(tokio::spawn(
            consumer.run(self.scheduler.clone(), self.cancel.clone()),
        ));
        self.handles
            .push(tokio::spawn(self.scheduler.clone().run(self.cancel.clone())));
        self.handles.push(tokio::spawn(Self::maintenance_loop(
            self.queue.clone(),
            Duration::from_secs(self.config.queue.expire_interval_secs.max(1)),
            self.status.clone(),
            self.cancel.clone(),
        )));

        self.status.write().await.running = true;
        info!("Director agent started");
        Ok(())
    }

    /// Cancels every loop and waits for them to finish.
    pub async fn shutdown(&mut self) -> SyncResult<()> {
        info!("Shutting down director agent");
        self.cancel.cancel();

        for handle in self.handles.drain(..) {
            if let Err(err) = handle.await {
                error!(error = %err, "Background task ended abnormally");
            }
        }

        self.status.write().await.running = false;
        info!("Director agent stopped");
        Ok(())
    }

    // =========================================================================
    // Loops
    // =========================================================================

    async fn enrollment_loop(
        db: Database,
        source: Arc<dyn EnrollmentSource>,
        settings: EnrollmentSettings,
        ready: Arc<AtomicBool>,
        status: Arc<RwLock<DirectorStatus>>,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(Duration::from_secs(settings.refresh_interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let refreshed = tokio::select! {
                _ = cancel.cancelled() => break,
                refreshed = refresh_devices(&db, source.as_ref(), &settings) => refreshed,
            };

            {
                let mut s = status.write().await;
                match refreshed {
                    Ok(count) => {
                        s.last_refresh_count = Some(count);
                        s.last_refresh_at = Some(Utc::now());
                        s.last_refresh_error = None;
                    }
                    Err(err) => {
                        error!(error = %err, retryable = err.is_retryable(), "Enrollment refresh failed");
                        s.last_refresh_error = Some(err.to_string());
                    }
                }
            }

            // The scheduler may start even if the first refresh failed.
            ready.store(true, Ordering::Release);
        }

        info!("Enrollment refresh loop stopped");
    }

    async fn maintenance_loop(
        queue: CommandQueue,
        every: Duration,
        status: Arc<RwLock<DirectorStatus>>,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match queue.expire_commands().await {
                Ok(expired) => status.write().await.expired_commands += expired,
                Err(err) => error!(error = %err, "Command expiry sweep failed"),
            }
        }

        info!("Maintenance loop stopped");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
