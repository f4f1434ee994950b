//! # Command Queue Manager
//!
//! Local bookkeeping for commands sent through a [`CommandDispatcher`].
//!
//! ## Command Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  send_command ──► enqueue ──► commands row (status "")                  │
//! │                                   │                                     │
//! │             device answers ───────┤                                     │
//! │                                   ▼                                     │
//! │        "NotNow" ◄──── process_acknowledgement ────► "Acknowledged"      │
//! │        (still queued)             │                  "Error"            │
//! │                                   │                  (terminal)         │
//! │                                   ▼                                     │
//! │   still "" / "NotNow" after 30 days ──► expire_commands deletes it      │
//! │                                                                         │
//! │  Dedup: command_in_queue / install_app_in_queue look only at rows in    │
//! │  {"", "NotNow"}.                                                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::commands::{CommandDispatcher, EnqueueOptions};
use crate::error::{SyncError, SyncResult};
use fleet_core::validation::validate_udid;
use fleet_core::{
    Command, CommandAcknowledgement, CommandSpec, CommandStatus, InfoClass, RequestType,
    COMMAND_EXPIRY_DAYS,
};
use fleet_db::Database;

/// Information queries are not re-sent while one is pending this recently.
const INFO_QUERY_DEDUP_HOURS: i64 = 1;

// =============================================================================
// Payload & Counters
// =============================================================================

/// A command addressed to one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub udid: String,
    pub command: CommandSpec,
    #[serde(default)]
    pub no_push: bool,
}

impl CommandPayload {
    pub fn new(udid: impl Into<String>, command: CommandSpec) -> Self {
        CommandPayload {
            udid: udid.into(),
            command,
            no_push: false,
        }
    }

    pub fn without_push(mut self) -> Self {
        self.no_push = true;
        self
    }
}

/// Running totals of dispatched commands.
#[derive(Debug, Default)]
pub struct DispatchCounters {
    commands_sent: AtomicU64,
    profiles_installed: AtomicU64,
    applications_installed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub commands_sent: u64,
    pub profiles_installed: u64,
    pub applications_installed: u64,
}

impl DispatchCounters {
    fn count(&self, request_type: &RequestType) {
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        match request_type {
            RequestType::InstallProfile => {
                self.profiles_installed.fetch_add(1, Ordering::Relaxed);
            }
            RequestType::InstallApplication => {
                self.applications_installed.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            profiles_installed: self.profiles_installed.load(Ordering::Relaxed),
            applications_installed: self.applications_installed.load(Ordering::Relaxed),
        }
    }
}

/// Rows removed by `clear_commands`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearReport {
    pub commands: u64,
    pub profiles: u64,
    pub applications: u64,
}

// =============================================================================
// Command Queue
// =============================================================================

/// Sends commands and tracks their delivery state.
#[derive(Clone)]
pub struct CommandQueue {
    db: Database,
    dispatcher: Option<Arc<dyn CommandDispatcher>>,
    counters: Arc<DispatchCounters>,
    clear_on_enroll: bool,
}

impl CommandQueue {
    /// `dispatcher` is `None` when no command server is configured; sends
    /// then fail with `ClientNotInitialized`.
    pub fn new(db: Database, dispatcher: Option<Arc<dyn CommandDispatcher>>) -> Self {
        CommandQueue {
            db,
            dispatcher,
            counters: Arc::new(DispatchCounters::default()),
            clear_on_enroll: false,
        }
    }

    pub fn with_clear_on_enroll(mut self, clear_on_enroll: bool) -> Self {
        self.clear_on_enroll = clear_on_enroll;
        self
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn dispatcher(&self) -> Option<&Arc<dyn CommandDispatcher>> {
        self.dispatcher.as_ref()
    }

    // =========================================================================
    // Sending
    // =========================================================================

    /// Enqueues a command for one device and records it.
    ///
    /// A per-target command error fails the call even though the HTTP round
    /// trip succeeded. A push error does not: the command is queued.
    pub async fn send_command(&self, payload: &CommandPayload) -> SyncResult<Command> {
        validate_udid(&payload.udid)?;
        let dispatcher = self
            .dispatcher
            .as_ref()
            .ok_or(SyncError::ClientNotInitialized)?;

        if self.db.devices().find(&payload.udid).await?.is_none() {
            return Err(SyncError::DeviceNotFound(payload.udid.clone()));
        }

        let targets = [payload.udid.clone()];
        let options = EnqueueOptions {
            no_push: payload.no_push,
        };
        let result = dispatcher.enqueue(&targets, &payload.command, options).await?;

        if let Some(reason) = result.command_error_for(&payload.udid) {
            return Err(SyncError::CommandRejected {
                udid: payload.udid.clone(),
                reason: reason.to_string(),
            });
        }
        if let Some(push_error) = result.push_error_for(&payload.udid) {
            warn!(udid = %payload.udid, error = %push_error, "Command queued but push failed");
        }

        let command_uuid = result
            .command_uuid_for(&payload.udid)
            .ok_or_else(|| SyncError::Decode("enqueue response carried no command UUID".into()))?;
        let request_type = result
            .request_type
            .as_deref()
            .map(RequestType::from)
            .unwrap_or_else(|| payload.command.request_type());

        let command = Command::queued(
            command_uuid,
            payload.udid.clone(),
            request_type,
            payload.command.dedup_key(),
        );
        self.db.commands().insert(&command).await?;
        self.counters.count(&command.request_type);

        info!(
            udid = %command.device_udid,
            command_uuid = %command.command_uuid,
            request_type = %command.request_type,
            "Command sent"
        );
        Ok(command)
    }

    /// Installs an application unless the same manifest is already queued.
    ///
    /// Returns `None` when suppressed.
    pub async fn install_application(&self, udid: &str, manifest_url: &str) -> SyncResult<Option<Command>> {
        if self.install_app_in_queue(udid, manifest_url).await? {
            debug!(udid, manifest_url, "Application install already queued");
            return Ok(None);
        }

        let payload = CommandPayload::new(
            udid,
            CommandSpec::InstallApplication {
                manifest_url: manifest_url.to_string(),
            },
        );
        self.send_command(&payload).await.map(Some)
    }

    /// Queues every information query not already pending in the last
    /// hour, then wakes the device once.
    pub async fn request_device_update(&self, udid: &str) -> SyncResult<Vec<Command>> {
        let since = Utc::now() - Duration::hours(INFO_QUERY_DEDUP_HOURS);
        let mut sent = Vec::new();

        for class in InfoClass::ALL {
            let request_type = class.request_type();
            if self.command_in_queue(udid, &request_type, since).await? {
                debug!(udid, request_type = %request_type, "Query already queued");
                continue;
            }

            let payload = CommandPayload::new(udid, CommandSpec::info_query(&request_type)?).without_push();
            sent.push(self.send_command(&payload).await?);
        }

        if !sent.is_empty() {
            if let Some(dispatcher) = &self.dispatcher {
                let result = dispatcher.push(&[udid.to_string()], None).await?;
                if let Some(push_error) = result.push_error_for(udid) {
                    warn!(udid, error = %push_error, "Device update queued but push failed");
                }
            }
        }

        Ok(sent)
    }

    // =========================================================================
    // Dedup Queries
    // =========================================================================

    /// True iff a queued command of this type was updated after `after`.
    pub async fn command_in_queue(
        &self,
        udid: &str,
        request_type: &RequestType,
        after: chrono::DateTime<Utc>,
    ) -> SyncResult<bool> {
        match self.db.commands().exists_queued(udid, request_type, after).await {
            Ok(found) => Ok(found),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// True iff an application install for this manifest is still queued.
    pub async fn install_app_in_queue(&self, udid: &str, manifest_url: &str) -> SyncResult<bool> {
        match self
            .db
            .commands()
            .exists_queued_with_data(udid, &RequestType::InstallApplication, manifest_url)
            .await
        {
            Ok(found) => Ok(found),
            Err(err) if err.is_not_found() => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    /// Forgets everything still pending for a device (used on re-enroll).
    pub async fn clear_commands(&self, udid: &str) -> SyncResult<ClearReport> {
        validate_udid(udid)?;

        let mut report = ClearReport {
            commands: self.db.commands().delete_non_terminal(udid).await?,
            ..Default::default()
        };

        if self.clear_on_enroll {
            report.profiles = self.db.profiles().delete_device_profiles(udid).await?;
            report.applications = self.db.applications().delete_for_device(udid).await?;
        }

        info!(
            udid,
            commands = report.commands,
            profiles = report.profiles,
            applications = report.applications,
            "Cleared pending commands"
        );
        Ok(report)
    }

    /// Deletes commands still queued after the expiry window.
    pub async fn expire_commands(&self) -> SyncResult<u64> {
        let cutoff = Utc::now() - Duration::days(COMMAND_EXPIRY_DAYS);
        let expired = self.db.commands().expire_before(cutoff).await?;

        if expired > 0 {
            info!(expired, %cutoff, "Expired stale commands");
        }
        Ok(expired)
    }

    // =========================================================================
    // Acknowledgements
    // =========================================================================

    /// Records a device's answer to a command.
    ///
    /// Unknown UUIDs are inserted when the request type is known (commands
    /// relayed by another sender). An acknowledged information query stamps
    /// the matching device timestamp; an acknowledged application install is
    /// recorded as installed.
    pub async fn process_acknowledgement(&self, ack: &CommandAcknowledgement) -> SyncResult<()> {
        let commands = self.db.commands();

        let command = match commands.find(&ack.command_uuid).await? {
            Some(command) => command,
            None => {
                let Some(request_type) = ack.request_type.clone() else {
                    debug!(
                        udid = %ack.udid,
                        command_uuid = %ack.command_uuid,
                        "Acknowledgement for unknown command ignored"
                    );
                    return Ok(());
                };
                let command = Command::queued(&ack.command_uuid, &ack.udid, request_type, None);
                commands.insert(&command).await?;
                command
            }
        };

        commands
            .update_status(&ack.command_uuid, ack.status, ack.error_chain.as_deref())
            .await?;

        match ack.status {
            CommandStatus::Acknowledged => self.on_acknowledged(&command).await?,
            CommandStatus::Error | CommandStatus::CommandFormatError => {
                warn!(
                    udid = %ack.udid,
                    command_uuid = %ack.command_uuid,
                    request_type = %command.request_type,
                    error = ?ack.error_chain,
                    "Device reported command failure"
                );
            }
            _ => {}
        }

        debug!(
            udid = %ack.udid,
            command_uuid = %ack.command_uuid,
            status = %ack.status,
            "Acknowledgement processed"
        );
        Ok(())
    }

    async fn on_acknowledged(&self, command: &Command) -> SyncResult<()> {
        if let Some(class) = InfoClass::from_request_type(&command.request_type) {
            self.db
                .devices()
                .update_info_timestamp(&command.device_udid, class, Utc::now())
                .await?;
        }

        if command.request_type == RequestType::InstallApplication {
            if let Some(manifest_url) = &command.data {
                self.db
                    .applications()
                    .record(&command.device_udid, manifest_url)
                    .await?;
            }
        }
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{memory_db, RecordingDispatcher};
    use fleet_core::{Device, Profile};

    async fn setup() -> (CommandQueue, Arc<RecordingDispatcher>, Database) {
        let db = memory_db().await;
        db.devices().insert(&Device::new("D1", "SERIAL1")).await.unwrap();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let queue = CommandQueue::new(db.clone(), Some(dispatcher.clone()));
        (queue, dispatcher, db)
    }

    fn install_profile(udid: &str) -> CommandPayload {
        CommandPayload::new(
            udid,
            CommandSpec::InstallProfile {
                payload: b"<plist/>".to_vec(),
            },
        )
    }

    #[tokio::test]
    async fn test_send_command_persists_record_and_counts() {
        let (queue, dispatcher, db) = setup().await;

        let command = queue.send_command(&install_profile("D1")).await.unwrap();

        assert_eq!(command.command_uuid, "CMD-1");
        assert_eq!(command.request_type, RequestType::InstallProfile);
        assert_eq!(command.status, CommandStatus::Pending);
        assert_eq!(db.commands().get("CMD-1").await.unwrap().device_udid, "D1");
        assert_eq!(dispatcher.enqueued()[0].0, vec!["D1".to_string()]);

        let counters = queue.counters();
        assert_eq!(counters.commands_sent, 1);
        assert_eq!(counters.profiles_installed, 1);
        assert_eq!(counters.applications_installed, 0);
    }

    #[tokio::test]
    async fn test_send_command_empty_udid_makes_no_call() {
        let (queue, dispatcher, _) = setup().await;

        let err = queue.send_command(&install_profile("")).await.unwrap_err();
        assert!(err.is_validation());
        assert!(dispatcher.enqueued().is_empty());
    }

    #[tokio::test]
    async fn test_send_command_without_client() {
        let db = memory_db().await;
        db.devices().insert(&Device::new("D1", "S")).await.unwrap();
        let queue = CommandQueue::new(db, None);

        let err = queue.send_command(&install_profile("D1")).await.unwrap_err();
        assert!(matches!(err, SyncError::ClientNotInitialized));
    }

    #[tokio::test]
    async fn test_send_command_unknown_device() {
        let (queue, dispatcher, _) = setup().await;

        let err = queue.send_command(&install_profile("NOPE")).await.unwrap_err();
        assert!(matches!(err, SyncError::DeviceNotFound(udid) if udid == "NOPE"));
        assert!(dispatcher.enqueued().is_empty());
    }

    #[tokio::test]
    async fn test_per_target_command_error_fails_the_call() {
        let (queue, dispatcher, db) = setup().await;
        dispatcher.reject_command("D1", "enrollment disabled");

        let err = queue.send_command(&install_profile("D1")).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::CommandRejected { ref reason, .. } if reason == "enrollment disabled"
        ));
        assert!(db.commands().list_for_device("D1").await.unwrap().is_empty());
        assert_eq!(queue.counters().commands_sent, 0);
    }

    #[tokio::test]
    async fn test_push_error_does_not_fail_the_call() {
        let (queue, dispatcher, _) = setup().await;
        dispatcher.reject_push("D1", "apns: device token inactive");

        let command = queue.send_command(&install_profile("D1")).await.unwrap();
        assert_eq!(command.command_uuid, "CMD-1");
    }

    #[tokio::test]
    async fn test_command_in_queue_respects_status_and_cutoff() {
        let (queue, _, db) = setup().await;
        let now = Utc::now();

        let mut queued = Command::queued("C1", "D1", RequestType::ProfileList, None);
        queued.updated_at = now - Duration::minutes(10);
        db.commands().insert(&queued).await.unwrap();

        let mut done = Command::queued("C2", "D1", RequestType::SecurityInfo, None);
        done.status = CommandStatus::Acknowledged;
        db.commands().insert(&done).await.unwrap();

        assert!(queue
            .command_in_queue("D1", &RequestType::ProfileList, now - Duration::hours(1))
            .await
            .unwrap());
        assert!(!queue
            .command_in_queue("D1", &RequestType::ProfileList, now - Duration::minutes(5))
            .await
            .unwrap());
        assert!(!queue
            .command_in_queue("D1", &RequestType::SecurityInfo, now - Duration::hours(1))
            .await
            .unwrap());
        assert!(!queue
            .command_in_queue("D9", &RequestType::ProfileList, now - Duration::hours(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_install_application_dedups_on_manifest() {
        let (queue, dispatcher, _) = setup().await;
        let url = "https://apps.example.com/app.plist";

        let first = queue.install_application("D1", url).await.unwrap();
        assert!(first.is_some());
        assert!(queue.install_app_in_queue("D1", url).await.unwrap());

        let second = queue.install_application("D1", url).await.unwrap();
        assert!(second.is_none());

        let other = queue
            .install_application("D1", "https://apps.example.com/other.plist")
            .await
            .unwrap();
        assert!(other.is_some());
        assert_eq!(dispatcher.enqueued().len(), 2);
        assert_eq!(queue.counters().applications_installed, 2);
    }

    #[tokio::test]
    async fn test_not_now_still_counts_as_queued() {
        let (queue, _, db) = setup().await;
        let url = "https://apps.example.com/app.plist";
        let mut command = Command::queued(
            "C1",
            "D1",
            RequestType::InstallApplication,
            Some(url.to_string()),
        );
        command.status = CommandStatus::NotNow;
        db.commands().insert(&command).await.unwrap();

        assert!(queue.install_app_in_queue("D1", url).await.unwrap());
    }

    #[tokio::test]
    async fn test_clear_commands_keeps_terminal_rows() {
        let (queue, _, db) = setup().await;
        db.commands()
            .insert(&Command::queued("C1", "D1", RequestType::ProfileList, None))
            .await
            .unwrap();
        let mut done = Command::queued("C2", "D1", RequestType::ProfileList, None);
        done.status = CommandStatus::Error;
        db.commands().insert(&done).await.unwrap();
        db.profiles()
            .upsert(&Profile {
                device_udid: Some("D1".into()),
                payload_identifier: "com.example.wifi".into(),
                payload_uuid: "U1".into(),
                mobileconfig_data: vec![1],
                installed: true,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let report = queue.clear_commands("D1").await.unwrap();
        assert_eq!(report.commands, 1);
        assert_eq!(report.profiles, 0);
        assert!(db.commands().find("C1").await.unwrap().is_none());
        assert!(db.commands().find("C2").await.unwrap().is_some());
        assert_eq!(db.profiles().device_profiles("D1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_clear_on_enroll_resets_device_state() {
        let (queue, _, db) = setup().await;
        let queue = queue.with_clear_on_enroll(true);
        db.applications()
            .record("D1", "https://apps.example.com/app.plist")
            .await
            .unwrap();
        db.profiles()
            .upsert(&Profile {
                device_udid: Some("D1".into()),
                payload_identifier: "com.example.wifi".into(),
                payload_uuid: "U1".into(),
                mobileconfig_data: vec![1],
                installed: true,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let report = queue.clear_commands("D1").await.unwrap();
        assert_eq!(report.profiles, 1);
        assert_eq!(report.applications, 1);
        assert!(db.applications().list_for_device("D1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expire_commands_only_removes_old_queued_rows() {
        let (queue, _, db) = setup().await;
        let old = Utc::now() - Duration::days(COMMAND_EXPIRY_DAYS + 1);

        let mut stale = Command::queued("OLD", "D1", RequestType::ProfileList, None);
        stale.updated_at = old;
        db.commands().insert(&stale).await.unwrap();

        let mut stale_done = Command::queued("OLD-ACK", "D1", RequestType::ProfileList, None);
        stale_done.status = CommandStatus::Acknowledged;
        stale_done.updated_at = old;
        db.commands().insert(&stale_done).await.unwrap();

        db.commands()
            .insert(&Command::queued("NEW", "D1", RequestType::ProfileList, None))
            .await
            .unwrap();

        assert_eq!(queue.expire_commands().await.unwrap(), 1);
        assert!(db.commands().find("OLD").await.unwrap().is_none());
        assert!(db.commands().find("OLD-ACK").await.unwrap().is_some());
        assert!(db.commands().find("NEW").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_acknowledged_info_query_stamps_device() {
        let (queue, _, db) = setup().await;
        let command = queue
            .send_command(&CommandPayload::new("D1", CommandSpec::SecurityInfo))
            .await
            .unwrap();

        queue
            .process_acknowledgement(&CommandAcknowledgement {
                udid: "D1".into(),
                command_uuid: command.command_uuid.clone(),
                status: CommandStatus::Acknowledged,
                request_type: None,
                error_chain: None,
            })
            .await
            .unwrap();

        let device = db.devices().get("D1").await.unwrap();
        assert!(device.last_received(InfoClass::SecurityInfo).is_some());
        assert!(device.last_received(InfoClass::ProfileList).is_none());
        assert_eq!(
            db.commands().get(&command.command_uuid).await.unwrap().status,
            CommandStatus::Acknowledged
        );
    }

    #[tokio::test]
    async fn test_relayed_acknowledgement_is_recorded() {
        let (queue, _, db) = setup().await;

        queue
            .process_acknowledgement(&CommandAcknowledgement {
                udid: "D1".into(),
                command_uuid: "RELAYED".into(),
                status: CommandStatus::Error,
                request_type: Some(RequestType::ProfileList),
                error_chain: Some("MDM error 12021".into()),
            })
            .await
            .unwrap();

        let stored = db.commands().get("RELAYED").await.unwrap();
        assert_eq!(stored.status, CommandStatus::Error);
        assert_eq!(stored.error_string.as_deref(), Some("MDM error 12021"));

        // Unknown UUID without a request type is dropped.
        queue
            .process_acknowledgement(&CommandAcknowledgement {
                udid: "D1".into(),
                command_uuid: "GHOST".into(),
                status: CommandStatus::Acknowledged,
                request_type: None,
                error_chain: None,
            })
            .await
            .unwrap();
        assert!(db.commands().find("GHOST").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_acknowledged_install_records_application() {
        let (queue, _, db) = setup().await;
        let url = "https://apps.example.com/app.plist";
        let command = queue.install_application("D1", url).await.unwrap().unwrap();

        queue
            .process_acknowledgement(&CommandAcknowledgement {
                udid: "D1".into(),
                command_uuid: command.command_uuid,
                status: CommandStatus::Acknowledged,
                request_type: None,
                error_chain: None,
            })
            .await
            .unwrap();

        let apps = db.applications().list_for_device("D1").await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].manifest_url, url);
        assert!(!queue.install_app_in_queue("D1", url).await.unwrap());
    }

    #[tokio::test]
    async fn test_request_device_update_skips_recent_queries() {
        let (queue, dispatcher, db) = setup().await;
        db.commands()
            .insert(&Command::queued("C1", "D1", RequestType::ProfileList, None))
            .await
            .unwrap();

        let sent = queue.request_device_update("D1").await.unwrap();

        let types: Vec<RequestType> = sent.iter().map(|c| c.request_type.clone()).collect();
        assert_eq!(
            types,
            vec![
                RequestType::DeviceInformation,
                RequestType::SecurityInfo,
                RequestType::CertificateList
            ]
        );
        assert!(dispatcher.enqueued().iter().all(|(_, _, opts)| opts.no_push));
        assert_eq!(dispatcher.pushed().len(), 1);

        // Everything is now queued: nothing sent, no push.
        let again = queue.request_device_update("D1").await.unwrap();
        assert!(again.is_empty());
        assert_eq!(dispatcher.pushed().len(), 1);
    }
}
