//! # Housekeeping Repository
//!
//! Cleanup run at the end of every push cycle.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. certificates  WHERE device_udid NOT IN devices     → DELETE       │
//! │  2. profile_lists WHERE device_udid NOT IN devices     → DELETE       │
//! │  3. unlock_pins   WHERE pin_set < now - 30 min         → DELETE       │
//! │  4. devices       WHERE erase = 0 AND lock = 0                         │
//! │                   AND unlock_pin IS NOT NULL           → SET NULL     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;
use fleet_core::UNLOCK_PIN_TTL_MINUTES;

/// Rows touched by one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HousekeepingReport {
    pub orphaned_certificates: u64,
    pub orphaned_profile_lists: u64,
    pub expired_unlock_pins: u64,
    pub cleared_device_pins: u64,
}

impl HousekeepingReport {
    pub fn total(&self) -> u64 {
        self.orphaned_certificates
            + self.orphaned_profile_lists
            + self.expired_unlock_pins
            + self.cleared_device_pins
    }
}

#[derive(Debug, Clone)]
pub struct HousekeepingRepository {
    pool: SqlitePool,
}

impl HousekeepingRepository {
    pub fn new(pool: SqlitePool) -> Self {
        HousekeepingRepository { pool }
    }

    /// Runs every sweep with `now` as the reference time.
    pub async fn run(&self, now: DateTime<Utc>) -> DbResult<HousekeepingReport> {
        let report = HousekeepingReport {
            orphaned_certificates: self.delete_orphaned_certificates().await?,
            orphaned_profile_lists: self.delete_orphaned_profile_lists().await?,
            expired_unlock_pins: self
                .delete_unlock_pins_before(now - Duration::minutes(UNLOCK_PIN_TTL_MINUTES))
                .await?,
            cleared_device_pins: self.clear_residual_device_pins().await?,
        };

        debug!(
            certificates = report.orphaned_certificates,
            profile_lists = report.orphaned_profile_lists,
            unlock_pins = report.expired_unlock_pins,
            device_pins = report.cleared_device_pins,
            "Housekeeping pass complete"
        );

        Ok(report)
    }

    pub async fn delete_orphaned_certificates(&self) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM certificates WHERE device_udid NOT IN (SELECT udid FROM devices)",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_orphaned_profile_lists(&self) -> DbResult<u64> {
        let result = sqlx::query(
            "DELETE FROM profile_lists WHERE device_udid NOT IN (SELECT udid FROM devices)",
        )
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_unlock_pins_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM unlock_pins WHERE pin_set < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    /// Fixed PINs are only meaningful while an erase or lock is pending.
    pub async fn clear_residual_device_pins(&self) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE devices SET unlock_pin = NULL, updated_at = ?1
            WHERE erase = 0 AND lock = 0 AND unlock_pin IS NOT NULL
            "#,
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Stores a transient unlock PIN (e.g. one generated for a lock command).
    pub async fn record_unlock_pin(&self, udid: &str, pin: &str, set_at: DateTime<Utc>) -> DbResult<()> {
        sqlx::query("INSERT INTO unlock_pins (device_udid, pin, pin_set) VALUES (?1, ?2, ?3)")
            .bind(udid)
            .bind(pin)
            .bind(set_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::test_support::memory_db;
    use fleet_core::Device;

    #[tokio::test]
    async fn test_housekeeping_removes_orphans_and_stale_pins() {
        let db = memory_db().await;
        let now = Utc::now();

        let mut locked = Device::new("LOCKED", "S1");
        locked.lock = true;
        locked.unlock_pin = Some("123456".to_string());
        db.devices().insert(&locked).await.unwrap();

        let mut idle = Device::new("IDLE", "S2");
        idle.unlock_pin = Some("654321".to_string());
        db.devices().insert(&idle).await.unwrap();

        for udid in ["LOCKED", "GONE"] {
            sqlx::query("INSERT INTO certificates (device_udid, created_at) VALUES (?1, ?2)")
                .bind(udid)
                .bind(now)
                .execute(db.pool())
                .await
                .unwrap();
            sqlx::query(
                "INSERT INTO profile_lists (device_udid, payload_identifier, created_at) VALUES (?1, 'p', ?2)",
            )
            .bind(udid)
            .bind(now)
            .execute(db.pool())
            .await
            .unwrap();
        }

        let repo = db.housekeeping();
        repo.record_unlock_pin("LOCKED", "111111", now - Duration::minutes(45)).await.unwrap();
        repo.record_unlock_pin("LOCKED", "222222", now - Duration::minutes(5)).await.unwrap();

        let report = repo.run(now).await.unwrap();
        assert_eq!(
            report,
            HousekeepingReport {
                orphaned_certificates: 1,
                orphaned_profile_lists: 1,
                expired_unlock_pins: 1,
                cleared_device_pins: 1,
            }
        );
        assert_eq!(report.total(), 4);

        assert_eq!(db.devices().get("LOCKED").await.unwrap().unlock_pin.as_deref(), Some("123456"));
        assert!(db.devices().get("IDLE").await.unwrap().unlock_pin.is_none());

        // A second pass has nothing left to do.
        assert_eq!(repo.run(now).await.unwrap().total(), 0);
    }
}
