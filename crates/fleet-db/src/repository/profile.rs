//! # Profile Repository
//!
//! Device-specific profiles override shared profiles with the same payload
//! identifier. `udids_with_device_profile` is the query the declaration
//! synchronizer uses to build its skip set.

use std::collections::HashSet;

use chrono::Utc;
use sqlx::SqlitePool;

use crate::error::{DbError, DbResult};
use fleet_core::Profile;

/// Repository for device-specific and shared profiles.
#[derive(Debug, Clone)]
pub struct ProfileRepository {
    pool: SqlitePool,
}

impl ProfileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ProfileRepository { pool }
    }

    /// Inserts or replaces a profile in the table matching its scope.
    pub async fn upsert(&self, profile: &Profile) -> DbResult<()> {
        match &profile.device_udid {
            Some(udid) => {
                sqlx::query(
                    r#"
                    INSERT INTO device_profiles (
                        device_udid, payload_identifier, payload_uuid,
                        mobileconfig_data, installed, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                    ON CONFLICT(device_udid, payload_identifier) DO UPDATE SET
                        payload_uuid = excluded.payload_uuid,
                        mobileconfig_data = excluded.mobileconfig_data,
                        installed = excluded.installed,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(udid)
                .bind(&profile.payload_identifier)
                .bind(&profile.payload_uuid)
                .bind(&profile.mobileconfig_data)
                .bind(profile.installed)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO shared_profiles (
                        payload_identifier, payload_uuid,
                        mobileconfig_data, installed, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(payload_identifier) DO UPDATE SET
                        payload_uuid = excluded.payload_uuid,
                        mobileconfig_data = excluded.mobileconfig_data,
                        installed = excluded.installed,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&profile.payload_identifier)
                .bind(&profile.payload_uuid)
                .bind(&profile.mobileconfig_data)
                .bind(profile.installed)
                .bind(Utc::now())
                .execute(&self.pool)
                .await?;
            }
        }

        Ok(())
    }

    pub async fn device_profiles(&self, udid: &str) -> DbResult<Vec<Profile>> {
        let profiles = sqlx::query_as::<_, Profile>(
            r#"
            SELECT device_udid, payload_identifier, payload_uuid,
                   mobileconfig_data, installed, updated_at
            FROM device_profiles
            WHERE device_udid = ?1
            ORDER BY payload_identifier
            "#,
        )
        .bind(udid)
        .fetch_all(&self.pool)
        .await?;

        Ok(profiles)
    }

    pub async fn shared_profiles(&self) -> DbResult<Vec<Profile>> {
        let profiles = sqlx::query_as::<_, Profile>(
            r#"
            SELECT NULL AS device_udid, payload_identifier, payload_uuid,
                   mobileconfig_data, installed, updated_at
            FROM shared_profiles
            ORDER BY payload_identifier
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(profiles)
    }

    /// Looks up the profile served at a device or shared download URL.
    pub async fn get(&self, udid: Option<&str>, payload_identifier: &str) -> DbResult<Profile> {
        let profile = match udid {
            Some(udid) => {
                sqlx::query_as::<_, Profile>(
                    r#"
                    SELECT device_udid, payload_identifier, payload_uuid,
                           mobileconfig_data, installed, updated_at
                    FROM device_profiles
                    WHERE device_udid = ?1 AND payload_identifier = ?2
                    "#,
                )
                .bind(udid)
                .bind(payload_identifier)
                .fetch_optional(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, Profile>(
                    r#"
                    SELECT NULL AS device_udid, payload_identifier, payload_uuid,
                           mobileconfig_data, installed, updated_at
                    FROM shared_profiles
                    WHERE payload_identifier = ?1
                    "#,
                )
                .bind(payload_identifier)
                .fetch_optional(&self.pool)
                .await?
            }
        };

        profile.ok_or_else(|| DbError::not_found("Profile", payload_identifier))
    }

    /// UDIDs that carry a device-specific profile with this identifier.
    pub async fn udids_with_device_profile(&self, payload_identifier: &str) -> DbResult<HashSet<String>> {
        let udids: Vec<String> = sqlx::query_scalar(
            "SELECT device_udid FROM device_profiles WHERE payload_identifier = ?1",
        )
        .bind(payload_identifier)
        .fetch_all(&self.pool)
        .await?;

        Ok(udids.into_iter().collect())
    }

    pub async fn delete_device_profiles(&self, udid: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM device_profiles WHERE device_udid = ?1")
            .bind(udid)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
