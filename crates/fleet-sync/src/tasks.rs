//! # Push Task Queue
//!
//! Hands device pushes from the scheduler to a pool of concurrent workers,
//! suppressing repeat submissions for the same device.
//!
//! ## Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  PushScheduler ── submit(udid, unique_for) ──┐                          │
//! │                                              ▼                          │
//! │                          ┌───────────────────────────────┐              │
//! │                          │ dedup: udid → suppressed until│──► Duplicate │
//! │                          └───────────────┬───────────────┘              │
//! │                                          ▼                              │
//! │                          bounded mpsc (queue_capacity)                  │
//! │                                          │                              │
//! │                                          ▼                              │
//! │  PushTaskConsumer ── Semaphore(workers) ──► JoinSet ──► PushHandler     │
//! │         ▲                                                               │
//! │         └── CancellationToken: stop taking work, drain in-flight tasks  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A suppression window starts when the task is accepted, not when it runs,
//! so a slow worker pool never causes the same device to be queued twice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};

/// Work performed for each accepted device.
#[async_trait]
pub trait PushHandler: Send + Sync + 'static {
    async fn handle(&self, udid: String);
}

// =============================================================================
// Handle
// =============================================================================

/// Submission side of the queue. Cheap to clone.
#[derive(Clone)]
pub struct PushTaskQueue {
    tx: mpsc::Sender<String>,
    suppressed: Arc<Mutex<HashMap<String, Instant>>>,
    completed: Arc<AtomicU64>,
    prune_threshold: usize,
}

impl PushTaskQueue {
    /// Creates the queue and its consumer. The consumer must be run for
    /// submissions beyond `capacity` to make progress.
    pub fn new(capacity: usize, workers: usize) -> (Self, PushTaskConsumer) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let completed = Arc::new(AtomicU64::new(0));

        let queue = PushTaskQueue {
            tx,
            suppressed: Arc::new(Mutex::new(HashMap::new())),
            completed: completed.clone(),
            prune_threshold: capacity,
        };
        let consumer = PushTaskConsumer {
            rx,
            limit: Arc::new(Semaphore::new(workers.max(1))),
            completed,
        };
        (queue, consumer)
    }

    /// Queues a push for `udid` unless one was accepted less than
    /// `unique_for` ago.
    ///
    /// Returns `SyncError::Duplicate` when suppressed and
    /// `SyncError::ShuttingDown` once the consumer is gone.
    pub async fn submit(&self, udid: &str, unique_for: Duration) -> SyncResult<()> {
        self.claim(udid, unique_for)?;

        if self.tx.send(udid.to_string()).await.is_err() {
            self.release(udid);
            return Err(SyncError::ShuttingDown);
        }
        Ok(())
    }

    /// Tasks the consumer has finished.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Devices currently inside their suppression window.
    pub fn suppressed(&self) -> usize {
        let now = Instant::now();
        self.lock_suppressed()
            .values()
            .filter(|until| **until > now)
            .count()
    }

    fn claim(&self, udid: &str, unique_for: Duration) -> SyncResult<()> {
        let now = Instant::now();
        let mut suppressed = self.lock_suppressed();

        if let Some(until) = suppressed.get(udid) {
            if *until > now {
                return Err(SyncError::Duplicate(udid.to_string()));
            }
        }

        if suppressed.len() >= self.prune_threshold {
            suppressed.retain(|_, until| *until > now);
        }
        suppressed.insert(udid.to_string(), now + unique_for);
        Ok(())
    }

    fn release(&self, udid: &str) {
        self.lock_suppressed().remove(udid);
    }

    fn lock_suppressed(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        // The map holds plain data; a panic mid-update cannot break it.
        self.suppressed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// Receiving side of the queue. Run exactly once.
pub struct PushTaskConsumer {
    rx: mpsc::Receiver<String>,
    limit: Arc<Semaphore>,
    completed: Arc<AtomicU64>,
}

impl PushTaskConsumer {
    /// Runs tasks until cancelled or until every queue handle is dropped.
    ///
    /// On cancellation, queued but unstarted tasks are dropped and running
    /// ones are awaited.
    pub async fn run(mut self, handler: Arc<dyn PushHandler>, cancel: CancellationToken) {
        info!(workers = self.limit.available_permits(), "Push task consumer started");
        let mut running = JoinSet::new();

        loop {
            let udid = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(udid) => udid,
                    None => break,
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = self.limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let handler = handler.clone();
            let completed = self.completed.clone();
            running.spawn(async move {
                debug!(udid = %udid, "Running push task");
                handler.handle(udid).await;
                completed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
            });

            while let Some(joined) = running.try_join_next() {
                if let Err(err) = joined {
                    warn!(error = %err, "Push task panicked");
                }
            }
        }

        let in_flight = running.len();
        while let Some(joined) = running.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "Push task panicked");
            }
        }

        info!(in_flight, "Push task consumer stopped");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
