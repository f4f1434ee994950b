//! # Enrollment Discovery
//!
//! Paginated, batched-parallel listing of every enrollment known to the
//! command server, mirrored into the local device table.
//!
//! ## Fetch Plan
//! ```text
//! page_size = 100, parallelism = 3
//!
//!   offset 0 ──────────────► 100 items (full page, keep going)
//!
//!   batch 1:  offset 100 ─┐
//!             offset 200 ─┼─ join_all ─► appended in offset order
//!             offset 300 ─┘              any short/empty page? stop
//!
//!   batch 2:  offset 400, 500, 600 ...
//! ```
//! A short first page is the whole answer. Any page error aborts the fetch
//! with that error; partial results are never returned.

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::EnrollmentSettings;
use crate::error::{SyncError, SyncResult};
use fleet_core::{Enrollment, ValidationError};
use fleet_db::Database;

// =============================================================================
// Source Abstraction
// =============================================================================

/// Filter sent with every page request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentFilter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub types: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl EnrollmentFilter {
    pub fn from_settings(settings: &EnrollmentSettings) -> Self {
        EnrollmentFilter {
            ids: Vec::new(),
            types: settings.types.clone(),
            enabled: settings.enabled_only.then_some(true),
        }
    }
}

/// Anything that can serve one page of enrollments.
#[async_trait]
pub trait EnrollmentSource: Send + Sync {
    async fn fetch_page(
        &self,
        filter: &EnrollmentFilter,
        limit: usize,
        offset: usize,
    ) -> SyncResult<Vec<Enrollment>>;
}

// =============================================================================
// Discovery
// =============================================================================

/// Fetches every enrollment matching `filter`.
///
/// `page_size` must be positive; `parallelism` 0 is treated as 1.
pub async fn fetch_all(
    source: &dyn EnrollmentSource,
    filter: &EnrollmentFilter,
    page_size: usize,
    parallelism: usize,
) -> SyncResult<Vec<Enrollment>> {
    if page_size == 0 {
        return Err(SyncError::Validation(ValidationError::OutOfRange {
            field: "page_size".to_string(),
            min: 1,
            max: i64::MAX,
        }));
    }
    let parallelism = parallelism.max(1);

    let mut enrollments = source.fetch_page(filter, page_size, 0).await?;
    if enrollments.len() < page_size {
        debug!(count = enrollments.len(), "Enrollment discovery finished on first page");
        return Ok(enrollments);
    }

    let mut offset = page_size;
    let mut batches = 0usize;
    loop {
        let offsets: Vec<usize> = (0..parallelism).map(|i| offset + i * page_size).collect();
        let pages = join_all(
            offsets
                .iter()
                .map(|&page_offset| source.fetch_page(filter, page_size, page_offset)),
        )
        .await;
        batches += 1;

        // join_all preserves input order, so pages are already in offset order.
        let pages = pages.into_iter().collect::<SyncResult<Vec<_>>>()?;
        let finished = pages.iter().any(|page| page.len() < page_size);
        for page in pages {
            enrollments.extend(page);
        }

        if finished {
            break;
        }
        offset += parallelism * page_size;
    }

    debug!(count = enrollments.len(), batches, "Enrollment discovery finished");
    Ok(enrollments)
}

/// Discovers enrollments and upserts each one into the device table.
///
/// Returns the number of enrollments mirrored.
pub async fn refresh_devices(
    db: &Database,
    source: &dyn EnrollmentSource,
    settings: &EnrollmentSettings,
) -> SyncResult<usize> {
    let filter = EnrollmentFilter::from_settings(settings);
    let enrollments = fetch_all(source, &filter, settings.page_size, settings.parallelism).await?;

    let devices = db.devices();
    for enrollment in &enrollments {
        devices
            .upsert_enrollment(&enrollment.id, &enrollment.serial_number, enrollment.enabled)
            .await?;
    }

    info!(count = enrollments.len(), "Device directory refreshed from enrollments");
    Ok(enrollments.len())
}

// =============================================================================
// Unit Tests
// =============================================================================
