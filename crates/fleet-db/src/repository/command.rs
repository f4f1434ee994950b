//! # Command Repository
//!
//! ## Command Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   insert ("" pending)                                                   │
//! │        │                                                                │
//! │        ├──► NotNow ──┐   (device busy, stays queued)                    │
//! │        │             │                                                  │
//! │        ▼             ▼                                                  │
//! │   Acknowledged / Error   (terminal, kept by clears)                    │
//! │   CommandFormatError / Idle   (dropped by clears)                      │
//! │                                                                         │
//! │   still "" / NotNow after 30 days ──► expire_before() hard-deletes     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! At most one queued command per (device, request type, data) is an
//! application-level rule: callers check `exists_queued*` before inserting.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use fleet_core::{Command, CommandStatus, RequestType};

const COMMAND_COLUMNS: &str = r#"
    command_uuid, device_udid, request_type, data, status,
    error_string, created_at, updated_at
"#;

/// Statuses that still count as queued, as a SQL list.
const QUEUED_STATUSES: &str = "('', 'NotNow')";

/// Statuses after which the device will not act again, as a SQL list.
const TERMINAL_STATUSES: &str = "('Acknowledged', 'Error')";

/// Repository for command records.
#[derive(Debug, Clone)]
pub struct CommandRepository {
    pool: SqlitePool,
}

impl CommandRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CommandRepository { pool }
    }

    pub async fn insert(&self, command: &Command) -> DbResult<()> {
        debug!(
            command_uuid = %command.command_uuid,
            udid = %command.device_udid,
            request_type = %command.request_type,
            "Recording command"
        );

        sqlx::query(
            r#"
            INSERT INTO commands (
                command_uuid, device_udid, request_type, data, status,
                error_string, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&command.command_uuid)
        .bind(&command.device_udid)
        .bind(command.request_type.as_str())
        .bind(&command.data)
        .bind(command.status.as_str())
        .bind(&command.error_string)
        .bind(command.created_at)
        .bind(command.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::Duplicate { field, .. } => DbError::Duplicate {
                field,
                value: command.command_uuid.clone(),
            },
            other => other,
        })?;

        Ok(())
    }

    pub async fn get(&self, command_uuid: &str) -> DbResult<Command> {
        self.find(command_uuid)
            .await?
            .ok_or_else(|| DbError::not_found("Command", command_uuid))
    }

    pub async fn find(&self, command_uuid: &str) -> DbResult<Option<Command>> {
        let sql = format!("SELECT {} FROM commands WHERE command_uuid = ?1", COMMAND_COLUMNS);
        let command = sqlx::query_as::<_, Command>(&sql)
            .bind(command_uuid)
            .fetch_optional(&self.pool)
            .await?;

        Ok(command)
    }

    /// All commands for one device, newest first.
    pub async fn list_for_device(&self, udid: &str) -> DbResult<Vec<Command>> {
        let sql = format!(
            "SELECT {} FROM commands WHERE device_udid = ?1 ORDER BY created_at DESC",
            COMMAND_COLUMNS
        );
        let commands = sqlx::query_as::<_, Command>(&sql)
            .bind(udid)
            .fetch_all(&self.pool)
            .await?;

        Ok(commands)
    }

    /// Records a device response. Returns false if the UUID is unknown.
    pub async fn update_status(
        &self,
        command_uuid: &str,
        status: CommandStatus,
        error_string: Option<&str>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE commands SET status = ?2, error_string = ?3, updated_at = ?4
            WHERE command_uuid = ?1
            "#,
        )
        .bind(command_uuid)
        .bind(status.as_str())
        .bind(error_string)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// True iff a queued command of this type was updated after `after`.
    pub async fn exists_queued(
        &self,
        udid: &str,
        request_type: &RequestType,
        after: DateTime<Utc>,
    ) -> DbResult<bool> {
        let sql = format!(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM commands
                WHERE device_udid = ?1 AND request_type = ?2
                  AND status IN {} AND updated_at > ?3
            )
            "#,
            QUEUED_STATUSES
        );

        let exists: bool = sqlx::query_scalar(&sql)
            .bind(udid)
            .bind(request_type.as_str())
            .bind(after)
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }

    /// True iff a queued command of this type carries the same dedup data.
    pub async fn exists_queued_with_data(
        &self,
        udid: &str,
        request_type: &RequestType,
        data: &str,
    ) -> DbResult<bool> {
        let sql = format!(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM commands
                WHERE device_udid = ?1 AND request_type = ?2
                  AND data = ?3 AND status IN {}
            )
            "#,
            QUEUED_STATUSES
        );

        let exists: bool = sqlx::query_scalar(&sql)
            .bind(udid)
            .bind(request_type.as_str())
            .bind(data)
            .fetch_one(&self.pool)
            .await?;

        Ok(exists)
    }

    /// Deletes every non-terminal command for a device.
    pub async fn delete_non_terminal(&self, udid: &str) -> DbResult<u64> {
        let sql = format!(
            "DELETE FROM commands WHERE device_udid = ?1 AND status NOT IN {}",
            TERMINAL_STATUSES
        );

        let result = sqlx::query(&sql).bind(udid).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    /// Dead-letter sweep: deletes queued commands last updated before `cutoff`.
    pub async fn expire_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let sql = format!(
            "DELETE FROM commands WHERE status IN {} AND updated_at < ?1",
            QUEUED_STATUSES
        );

        let result = sqlx::query(&sql).bind(cutoff).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::memory_db;
    use chrono::Duration;

    fn command_at(uuid: &str, rt: RequestType, status: CommandStatus, age: Duration) -> Command {
        let mut command = Command::queued(uuid, "D1", rt, None);
        command.status = status;
        command.created_at = Utc::now() - age;
        command.updated_at = command.created_at;
        command
    }

    #[tokio::test]
    async fn test_insert_and_get_round_trip() {
        let db = memory_db().await;
        let repo = db.commands();

        let command = Command::queued(
            "C1",
            "D1",
            RequestType::InstallApplication,
            Some("https://apps.example.com/a.plist".to_string()),
        );
        repo.insert(&command).await.unwrap();

        let stored = repo.get("C1").await.unwrap();
        assert_eq!(stored.request_type, RequestType::InstallApplication);
        assert_eq!(stored.status, CommandStatus::Pending);
        assert_eq!(stored.data.as_deref(), Some("https://apps.example.com/a.plist"));
    }

    #[tokio::test]
    async fn test_duplicate_uuid_is_rejected() {
        let db = memory_db().await;
        let repo = db.commands();
        let command = Command::queued("C1", "D1", RequestType::ProfileList, None);

        repo.insert(&command).await.unwrap();
        let err = repo.insert(&command).await.unwrap_err();
        assert!(matches!(err, DbError::Duplicate { ref value, .. } if value == "C1"));
    }

    #[tokio::test]
    async fn test_exists_queued_respects_status_and_cutoff() {
        let db = memory_db().await;
        let repo = db.commands();
        let cutoff = Utc::now() - Duration::hours(1);

        repo.insert(&command_at("old", RequestType::ProfileList, CommandStatus::Pending, Duration::hours(2)))
            .await
            .unwrap();
        assert!(!repo.exists_queued("D1", &RequestType::ProfileList, cutoff).await.unwrap());

        repo.insert(&command_at("done", RequestType::ProfileList, CommandStatus::Acknowledged, Duration::minutes(5)))
            .await
            .unwrap();
        assert!(!repo.exists_queued("D1", &RequestType::ProfileList, cutoff).await.unwrap());

        repo.insert(&command_at("busy", RequestType::ProfileList, CommandStatus::NotNow, Duration::minutes(5)))
            .await
            .unwrap();
        assert!(repo.exists_queued("D1", &RequestType::ProfileList, cutoff).await.unwrap());
        assert!(!repo.exists_queued("D1", &RequestType::SecurityInfo, cutoff).await.unwrap());
        assert!(!repo.exists_queued("D2", &RequestType::ProfileList, cutoff).await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_queued_with_data_matches_payload() {
        let db = memory_db().await;
        let repo = db.commands();
        let url = "https://apps.example.com/a.plist";

        repo.insert(&Command::queued("C1", "D1", RequestType::InstallApplication, Some(url.to_string())))
            .await
            .unwrap();

        assert!(repo
            .exists_queued_with_data("D1", &RequestType::InstallApplication, url)
            .await
            .unwrap());
        assert!(!repo
            .exists_queued_with_data("D1", &RequestType::InstallApplication, "https://other")
            .await
            .unwrap());

        repo.update_status("C1", CommandStatus::Error, Some("boom")).await.unwrap();
        assert!(!repo
            .exists_queued_with_data("D1", &RequestType::InstallApplication, url)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_delete_non_terminal_keeps_history() {
        let db = memory_db().await;
        let repo = db.commands();
        let zero = Duration::zero();

        repo.insert(&command_at("a", RequestType::ProfileList, CommandStatus::Pending, zero)).await.unwrap();
        repo.insert(&command_at("b", RequestType::ProfileList, CommandStatus::NotNow, zero)).await.unwrap();
        repo.insert(&command_at("c", RequestType::ProfileList, CommandStatus::Idle, zero)).await.unwrap();
        repo.insert(&command_at("d", RequestType::ProfileList, CommandStatus::Acknowledged, zero)).await.unwrap();
        repo.insert(&command_at("e", RequestType::ProfileList, CommandStatus::Error, zero)).await.unwrap();
        repo.insert(&command_at("f", RequestType::ProfileList, CommandStatus::CommandFormatError, zero))
            .await
            .unwrap();

        assert_eq!(repo.delete_non_terminal("D1").await.unwrap(), 4);

        let left: Vec<_> = repo
            .list_for_device("D1")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.command_uuid)
            .collect();
        assert_eq!(left.len(), 2);
        assert!(left.contains(&"d".to_string()));
        assert!(left.contains(&"e".to_string()));
        assert!(!left.contains(&"f".to_string()));
    }

    #[tokio::test]
    async fn test_expire_before_only_removes_stale_queued() {
        let db = memory_db().await;
        let repo = db.commands();

        repo.insert(&command_at("stale", RequestType::ProfileList, CommandStatus::Pending, Duration::days(31)))
            .await
            .unwrap();
        repo.insert(&command_at("stale-notnow", RequestType::ProfileList, CommandStatus::NotNow, Duration::days(40)))
            .await
            .unwrap();
        repo.insert(&command_at("fresh", RequestType::ProfileList, CommandStatus::Pending, Duration::days(1)))
            .await
            .unwrap();
        repo.insert(&command_at("old-ack", RequestType::ProfileList, CommandStatus::Acknowledged, Duration::days(90)))
            .await
            .unwrap();

        let removed = repo.expire_before(Utc::now() - Duration::days(30)).await.unwrap();
        assert_eq!(removed, 2);
        assert!(repo.find("fresh").await.unwrap().is_some());
        assert!(repo.find("old-ack").await.unwrap().is_some());
        assert!(repo.find("stale").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_status_unknown_uuid() {
        let db = memory_db().await;
        assert!(!db
            .commands()
            .update_status("nope", CommandStatus::Acknowledged, None)
            .await
            .unwrap());
    }
}
