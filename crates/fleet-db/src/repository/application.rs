//! # Application Repository
//!
//! Applications the director has asked a device to install.

use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::DbResult;
use fleet_core::InstalledApplication;

#[derive(Debug, Clone)]
pub struct ApplicationRepository {
    pool: SqlitePool,
}

impl ApplicationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ApplicationRepository { pool }
    }

    pub async fn record(&self, udid: &str, manifest_url: &str) -> DbResult<InstalledApplication> {
        let app = InstalledApplication {
            id: Uuid::new_v4().to_string(),
            device_udid: udid.to_string(),
            manifest_url: manifest_url.to_string(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO device_install_applications (id, device_udid, manifest_url, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(&app.id)
        .bind(&app.device_udid)
        .bind(&app.manifest_url)
        .bind(app.created_at)
        .execute(&self.pool)
        .await?;

        Ok(app)
    }

    pub async fn list_for_device(&self, udid: &str) -> DbResult<Vec<InstalledApplication>> {
        let apps = sqlx::query_as::<_, InstalledApplication>(
            r#"
            SELECT id, device_udid, manifest_url, created_at
            FROM device_install_applications
            WHERE device_udid = ?1
            ORDER BY created_at
            "#,
        )
        .bind(udid)
        .fetch_all(&self.pool)
        .await?;

        Ok(apps)
    }

    pub async fn delete_for_device(&self, udid: &str) -> DbResult<u64> {
        let result = sqlx::query("DELETE FROM device_install_applications WHERE device_udid = ?1")
            .bind(udid)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
