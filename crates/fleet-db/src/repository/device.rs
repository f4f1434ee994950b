//! # Device Repository
//!
//! The device table is written concurrently by the enrollment refresh loop,
//! the push scheduler and acknowledgement processing. Every write is a
//! single-row statement so writers for different devices never contend.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use fleet_core::{Device, InfoClass};

const DEVICE_COLUMNS: &str = r#"
    udid, serial_number, active, erase, lock, unlock_pin,
    last_certificate_list_received, last_profile_list_received,
    last_security_info_received, last_device_info_received,
    next_push, created_at, updated_at
"#;

/// Repository for device operations.
#[derive(Debug, Clone)]
pub struct DeviceRepository {
    pool: SqlitePool,
}

impl DeviceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DeviceRepository { pool }
    }

    /// Gets a device by UDID, failing with `NotFound` if it is unknown.
    pub async fn get(&self, udid: &str) -> DbResult<Device> {
        self.find(udid)
            .await?
            .ok_or_else(|| DbError::not_found("Device", udid))
    }

    pub async fn find(&self, udid: &str) -> DbResult<Option<Device>> {
        let sql = format!("SELECT {} FROM devices WHERE udid = ?1", DEVICE_COLUMNS);
        let device = sqlx::query_as::<_, Device>(&sql)
            .bind(udid)
            .fetch_optional(&self.pool)
            .await?;

        Ok(device)
    }

    /// Every device, active or not, ordered by UDID.
    pub async fn list_all(&self) -> DbResult<Vec<Device>> {
        let sql = format!("SELECT {} FROM devices ORDER BY udid", DEVICE_COLUMNS);
        let devices = sqlx::query_as::<_, Device>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(devices)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM devices")
            .fetch_one(&self.pool)
            .await?;

        Ok(count)
    }

    /// Inserts a full device record.
    pub async fn insert(&self, device: &Device) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO devices (
                udid, serial_number, active, erase, lock, unlock_pin,
                last_certificate_list_received, last_profile_list_received,
                last_security_info_received, last_device_info_received,
                next_push, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&device.udid)
        .bind(&device.serial_number)
        .bind(device.active)
        .bind(device.erase)
        .bind(device.lock)
        .bind(&device.unlock_pin)
        .bind(device.last_certificate_list_received)
        .bind(device.last_profile_list_received)
        .bind(device.last_security_info_received)
        .bind(device.last_device_info_received)
        .bind(device.next_push)
        .bind(device.created_at)
        .bind(device.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mirrors one discovered enrollment: insert if new, otherwise refresh
    /// serial number and active flag. Schedule and info timestamps are kept.
    pub async fn upsert_enrollment(&self, udid: &str, serial_number: &str, active: bool) -> DbResult<()> {
        let now = Utc::now();

        debug!(udid = %udid, active, "Upserting enrollment");

        sqlx::query(
            r#"
            INSERT INTO devices (udid, serial_number, active, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(udid) DO UPDATE SET
                serial_number = CASE
                    WHEN excluded.serial_number = '' THEN devices.serial_number
                    ELSE excluded.serial_number
                END,
                active = excluded.active,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(udid)
        .bind(serial_number)
        .bind(active)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stamps the last-received time for one information class.
    ///
    /// Returns false if the device is unknown.
    pub async fn update_info_timestamp(
        &self,
        udid: &str,
        class: InfoClass,
        at: DateTime<Utc>,
    ) -> DbResult<bool> {
        // Column names come from a closed enum, never from input.
        let sql = format!(
            "UPDATE devices SET {} = ?2, updated_at = ?3 WHERE udid = ?1",
            class.column()
        );

        let result = sqlx::query(&sql)
            .bind(udid)
            .bind(at)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_next_push(&self, udid: &str, next_push: Option<DateTime<Utc>>) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE devices SET next_push = ?2, updated_at = ?3 WHERE udid = ?1",
        )
        .bind(udid)
        .bind(next_push)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Checkout sets `active = false`; devices are never hard-deleted.
    pub async fn set_active(&self, udid: &str, active: bool) -> DbResult<bool> {
        let result = sqlx::query("UPDATE devices SET active = ?2, updated_at = ?3 WHERE udid = ?1")
            .bind(udid)
            .bind(active)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Flags a device for erase or lock with a fixed unlock PIN.
    pub async fn set_security_flags(
        &self,
        udid: &str,
        erase: bool,
        lock: bool,
        unlock_pin: Option<&str>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET erase = ?2, lock = ?3, unlock_pin = ?4, updated_at = ?5
            WHERE udid = ?1
            "#,
        )
        .bind(udid)
        .bind(erase)
        .bind(lock)
        .bind(unlock_pin)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
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

    #[tokio::test]
    async fn test_upsert_inserts_then_updates() {
        let db = memory_db().await;
        let repo = db.devices();

        repo.upsert_enrollment("D1", "C02ABC", true).await.unwrap();
        let first = repo.get("D1").await.unwrap();
        assert!(first.active);
        assert_eq!(first.serial_number, "C02ABC");

        repo.upsert_enrollment("D1", "", false).await.unwrap();
        let second = repo.get("D1").await.unwrap();
        assert!(!second.active);
        assert_eq!(second.serial_number, "C02ABC");
        assert_eq!(repo.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_upsert_keeps_schedule_and_timestamps() {
        let db = memory_db().await;
        let repo = db.devices();
        let now = Utc::now();

        repo.upsert_enrollment("D1", "C02ABC", true).await.unwrap();
        repo.set_next_push("D1", Some(now + Duration::hours(1))).await.unwrap();
        repo.update_info_timestamp("D1", InfoClass::ProfileList, now).await.unwrap();

        repo.upsert_enrollment("D1", "C02ABC", true).await.unwrap();
        let device = repo.get("D1").await.unwrap();
        assert!(device.next_push.is_some());
        assert!(device.last_profile_list_received.is_some());
    }

    #[tokio::test]
    async fn test_get_unknown_device_is_not_found() {
        let db = memory_db().await;
        let err = db.devices().get("missing").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(db.devices().find("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_info_timestamp_targets_one_column() {
        let db = memory_db().await;
        let repo = db.devices();
        repo.insert(&Device::new("D1", "S1")).await.unwrap();

        let at = Utc::now();
        assert!(repo
            .update_info_timestamp("D1", InfoClass::SecurityInfo, at)
            .await
            .unwrap());

        let device = repo.get("D1").await.unwrap();
        assert_eq!(
            device.last_security_info_received.map(|t| t.timestamp()),
            Some(at.timestamp())
        );
        assert!(device.last_device_info_received.is_none());

        assert!(!repo
            .update_info_timestamp("nope", InfoClass::SecurityInfo, at)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_set_active_and_list_all() {
        let db = memory_db().await;
        let repo = db.devices();
        repo.insert(&Device::new("D2", "S2")).await.unwrap();
        repo.insert(&Device::new("D1", "S1")).await.unwrap();

        repo.set_active("D2", false).await.unwrap();

        let all = repo.list_all().await.unwrap();
        let udids: Vec<_> = all.iter().map(|d| d.udid.as_str()).collect();
        assert_eq!(udids, vec!["D1", "D2"]);
        assert!(!all[1].active);
    }
}
