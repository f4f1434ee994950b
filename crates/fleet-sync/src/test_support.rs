//! Shared fixtures for unit tests: local HTTP servers, in-memory databases
//! and recording doubles for both protocol capabilities.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;

use crate::commands::{ApiResult, CommandDispatcher, EnqueueOptions, EnrollmentStatus, QueuedCommand};
use crate::config::CommandDialect;
use crate::declarations::{DeclarationApi, PutOutcome};
use crate::error::{SyncError, SyncResult};
use fleet_core::{CommandSpec, Declaration};
use fleet_db::{Database, DbConfig};

/// Serves `app` on an ephemeral local port and returns its base URL.
pub async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("listener address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    format!("http://{}", addr)
}

pub async fn memory_db() -> Database {
    Database::new(DbConfig::in_memory())
        .await
        .expect("in-memory database")
}

// =============================================================================
// Declaration Double
// =============================================================================

/// Records every call as a line like `put <id> notify=false`.
#[derive(Default)]
pub struct RecordingDeclarations {
    calls: Mutex<Vec<String>>,
    stored: Mutex<Vec<Declaration>>,
    unchanged: Mutex<HashSet<String>>,
    fail_prefixes: Mutex<Vec<String>>,
    missing_prefixes: Mutex<Vec<String>>,
}

impl RecordingDeclarations {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn declarations(&self) -> Vec<Declaration> {
        self.stored.lock().unwrap().clone()
    }

    /// PUTs of this identifier report `Unchanged`.
    pub fn mark_unchanged(&self, id: &str) {
        self.unchanged.lock().unwrap().insert(id.to_string());
    }

    /// Calls starting with `prefix` fail with a 500.
    pub fn fail_on(&self, prefix: &str) {
        self.fail_prefixes.lock().unwrap().push(prefix.to_string());
    }

    /// Calls starting with `prefix` report not-found.
    pub fn not_found_on(&self, prefix: &str) {
        self.missing_prefixes.lock().unwrap().push(prefix.to_string());
    }

    fn record(&self, call: String) -> SyncResult<()> {
        let outcome = if self
            .fail_prefixes
            .lock()
            .unwrap()
            .iter()
            .any(|p| call.starts_with(p.as_str()))
        {
            Err(SyncError::protocol(StatusCode::INTERNAL_SERVER_ERROR, "injected"))
        } else if self
            .missing_prefixes
            .lock()
            .unwrap()
            .iter()
            .any(|p| call.starts_with(p.as_str()))
        {
            Err(SyncError::NotFound(call.clone()))
        } else {
            Ok(())
        };

        self.calls.lock().unwrap().push(call);
        outcome
    }
}

#[async_trait]
impl DeclarationApi for RecordingDeclarations {
    async fn put_declaration(&self, declaration: &Declaration, notify: bool) -> SyncResult<PutOutcome> {
        self.record(format!("put {} notify={}", declaration.identifier, notify))?;
        self.stored.lock().unwrap().push(declaration.clone());

        if self.unchanged.lock().unwrap().contains(&declaration.identifier) {
            Ok(PutOutcome::Unchanged)
        } else {
            Ok(PutOutcome::Changed)
        }
    }

    async fn touch_declaration(&self, id: &str, notify: bool) -> SyncResult<()> {
        self.record(format!("touch {} notify={}", id, notify))
    }

    async fn get_declaration(&self, id: &str) -> SyncResult<Declaration> {
        self.record(format!("get {}", id))?;
        self.stored
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|d| d.identifier == id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(id.to_string()))
    }

    async fn delete_declaration(&self, id: &str, notify: bool) -> SyncResult<()> {
        self.record(format!("delete {} notify={}", id, notify))
    }

    async fn put_set_declaration(&self, set: &str, declaration_id: &str, notify: bool) -> SyncResult<()> {
        self.record(format!("set+ {} {} notify={}", set, declaration_id, notify))
    }

    async fn delete_set_declaration(
        &self,
        set: &str,
        declaration_id: &str,
        notify: bool,
    ) -> SyncResult<()> {
        self.record(format!("set- {} {} notify={}", set, declaration_id, notify))
    }

    async fn set_declarations(&self, set: &str) -> SyncResult<Vec<String>> {
        self.record(format!("list {}", set))?;
        Ok(Vec::new())
    }

    async fn put_enrollment_set(&self, enrollment_id: &str, set: &str, notify: bool) -> SyncResult<()> {
        self.record(format!("enroll {} {} notify={}", enrollment_id, set, notify))
    }

    async fn enrollment_sets(&self, enrollment_id: &str) -> SyncResult<Vec<String>> {
        self.record(format!("sets {}", enrollment_id))?;
        Ok(Vec::new())
    }
}

// =============================================================================
// Command Double
// =============================================================================

/// Records dispatches; command UUIDs are `CMD-1`, `CMD-2`, ...
#[derive(Default)]
pub struct RecordingDispatcher {
    enqueued: Mutex<Vec<(Vec<String>, CommandSpec, EnqueueOptions)>>,
    pushed: Mutex<Vec<(Vec<String>, Option<DateTime<Utc>>)>>,
    cleared: Mutex<Vec<Vec<String>>>,
    command_errors: Mutex<HashMap<String, String>>,
    push_errors: Mutex<HashMap<String, String>>,
    fail_calls: AtomicBool,
    push_delay: Mutex<Duration>,
    sequence: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl RecordingDispatcher {
    pub fn enqueued(&self) -> Vec<(Vec<String>, CommandSpec, EnqueueOptions)> {
        self.enqueued.lock().unwrap().clone()
    }

    pub fn pushed(&self) -> Vec<(Vec<String>, Option<DateTime<Utc>>)> {
        self.pushed.lock().unwrap().clone()
    }

    pub fn cleared(&self) -> Vec<Vec<String>> {
        self.cleared.lock().unwrap().clone()
    }

    /// Highest number of pushes observed running at once.
    pub fn max_concurrent_pushes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// The server answers 2xx but refuses the command for `udid`.
    pub fn reject_command(&self, udid: &str, reason: &str) {
        self.command_errors
            .lock()
            .unwrap()
            .insert(udid.to_string(), reason.to_string());
    }

    /// The command is queued but the wake signal for `udid` fails.
    pub fn reject_push(&self, udid: &str, reason: &str) {
        self.push_errors
            .lock()
            .unwrap()
            .insert(udid.to_string(), reason.to_string());
    }

    /// Every later call fails at call level.
    pub fn fail_calls(&self) {
        self.fail_calls.store(true, Ordering::SeqCst);
    }

    pub fn set_push_delay(&self, delay: Duration) {
        *self.push_delay.lock().unwrap() = delay;
    }

    fn check_call(&self) -> SyncResult<()> {
        if self.fail_calls.load(Ordering::SeqCst) {
            return Err(SyncError::protocol(StatusCode::INTERNAL_SERVER_ERROR, "injected"));
        }
        Ok(())
    }

    fn statuses(&self, ids: &[String]) -> HashMap<String, EnrollmentStatus> {
        let command_errors = self.command_errors.lock().unwrap();
        let push_errors = self.push_errors.lock().unwrap();
        ids.iter()
            .map(|id| {
                (
                    id.clone(),
                    EnrollmentStatus {
                        push_error: push_errors.get(id).cloned(),
                        command_error: command_errors.get(id).cloned(),
                        ..Default::default()
                    },
                )
            })
            .collect()
    }
}

#[async_trait]
impl CommandDispatcher for RecordingDispatcher {
    fn dialect(&self) -> CommandDialect {
        CommandDialect::Enqueue
    }

    async fn push(&self, ids: &[String], expiration: Option<DateTime<Utc>>) -> SyncResult<ApiResult> {
        crate::commands::require_targets(ids)?;
        self.pushed.lock().unwrap().push((ids.to_vec(), expiration));

        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        let delay = *self.push_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.check_call()?;
        Ok(ApiResult {
            status: self.statuses(ids),
            ..Default::default()
        })
    }

    async fn enqueue(
        &self,
        ids: &[String],
        command: &CommandSpec,
        options: EnqueueOptions,
    ) -> SyncResult<ApiResult> {
        crate::commands::require_targets(ids)?;
        self.enqueued
            .lock()
            .unwrap()
            .push((ids.to_vec(), command.clone(), options));
        self.check_call()?;

        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ApiResult {
            status: self.statuses(ids),
            no_push: options.no_push,
            command_uuid: Some(format!("CMD-{}", n)),
            request_type: Some(command.request_type().to_string()),
            ..Default::default()
        })
    }

    async fn inspect_queue(&self, id: &str) -> SyncResult<Vec<QueuedCommand>> {
        crate::commands::require_targets(&[id])?;
        self.check_call()?;
        Ok(Vec::new())
    }

    async fn clear_queue(&self, ids: &[String]) -> SyncResult<()> {
        crate::commands::require_targets(ids)?;
        self.cleared.lock().unwrap().push(ids.to_vec());
        self.check_call()
    }
}
