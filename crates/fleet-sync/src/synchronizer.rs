//! # Declaration Synchronizer
//!
//! Delivers profiles to devices as a pair of declarations (content +
//! activation) in the device's set.
//!
//! ## Push Choreography
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │ 1. PUT content      (nonotify) ── unchanged? ──► touch content          │
//! │ 2. PUT activation   (nonotify) ── unchanged? ──► touch activation       │
//! │ 3. set += content   (nonotify)                                          │
//! │ 4. set += activation(nonotify)                                          │
//! │ 5. enrollment ↔ set (NOTIFY)   ◄── the only step the device sees        │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delete Choreography
//! ```text
//! set -= content, set -= activation, delete content, delete activation,
//! enrollment ↔ set (NOTIFY)
//! ```
//! Not-found on any removal step means the work is already done.
//!
//! Every step gates the next; the first failure is returned as
//! `SyncError::DeclarationStep` naming the step and profile. Bulk helpers
//! log per-item failures and carry on.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::declarations::{DeclarationApi, PutOutcome};
use crate::error::{SyncError, SyncResult};
use fleet_core::declaration::{device_set_name, sanitize_profile_id};
use fleet_core::validation::{validate_payload_identifier, validate_udid};
use fleet_core::{Declaration, DeclarationIds, Profile};
use fleet_db::Database;

// =============================================================================
// Steps
// =============================================================================

/// One step of a declaration push or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationStep {
    PutContent,
    TouchContent,
    PutActivation,
    TouchActivation,
    AssociateContent,
    AssociateActivation,
    DissociateContent,
    DissociateActivation,
    DeleteContent,
    DeleteActivation,
    SyncEnrollment,
}

impl fmt::Display for DeclarationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeclarationStep::PutContent => "put content",
            DeclarationStep::TouchContent => "touch content",
            DeclarationStep::PutActivation => "put activation",
            DeclarationStep::TouchActivation => "touch activation",
            DeclarationStep::AssociateContent => "associate content",
            DeclarationStep::AssociateActivation => "associate activation",
            DeclarationStep::DissociateContent => "dissociate content",
            DeclarationStep::DissociateActivation => "dissociate activation",
            DeclarationStep::DeleteContent => "delete content",
            DeclarationStep::DeleteActivation => "delete activation",
            DeclarationStep::SyncEnrollment => "sync enrollment",
        };
        f.write_str(name)
    }
}

// =============================================================================
// Bulk Report
// =============================================================================

/// Tally of a bulk push or delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BulkReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Devices passed over because a device-specific profile wins.
    pub skipped: usize,
}

impl BulkReport {
    fn record(&mut self, outcome: &SyncResult<()>) {
        self.attempted += 1;
        match outcome {
            Ok(()) => self.succeeded += 1,
            Err(_) => self.failed += 1,
        }
    }
}

// =============================================================================
// Synchronizer
// =============================================================================

/// Pushes and removes profile declarations for devices.
#[derive(Clone)]
pub struct DeclarationSync {
    api: Arc<dyn DeclarationApi>,
    db: Database,
    namespace: String,
    profile_base_url: String,
}

impl DeclarationSync {
    pub fn new(
        api: Arc<dyn DeclarationApi>,
        db: Database,
        namespace: impl Into<String>,
        profile_base_url: impl Into<String>,
    ) -> Self {
        DeclarationSync {
            api,
            db,
            namespace: namespace.into(),
            profile_base_url: profile_base_url.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Where the device downloads the profile bytes.
    ///
    /// ```text
    /// device-specific: {base}/{udid}/{sanitized}.mobileconfig
    /// shared:          {base}/shared/{sanitized}.mobileconfig
    /// ```
    pub fn profile_url(&self, profile: &Profile) -> String {
        let base = self.profile_base_url.trim_end_matches('/');
        let owner = profile.device_udid.as_deref().unwrap_or("shared");
        format!(
            "{}/{}/{}.mobileconfig",
            base,
            owner,
            sanitize_profile_id(&profile.payload_identifier)
        )
    }

    // =========================================================================
    // Single Profile
    // =========================================================================

    /// Pushes one profile to one device.
    pub async fn push_profile(&self, udid: &str, profile: &Profile) -> SyncResult<()> {
        validate_udid(udid)?;
        validate_payload_identifier(&profile.payload_identifier)?;

        let pid = profile.payload_identifier.as_str();
        let ids = DeclarationIds::derive(&self.namespace, udid, pid);
        let set = device_set_name(&self.namespace, udid);

        let content = Declaration::legacy_profile(&ids.legacy, self.profile_url(profile));
        self.put_or_touch(&content, DeclarationStep::PutContent, DeclarationStep::TouchContent, pid)
            .await?;

        let activation = Declaration::activation(&ids.activation, &ids.legacy);
        self.put_or_touch(
            &activation,
            DeclarationStep::PutActivation,
            DeclarationStep::TouchActivation,
            pid,
        )
        .await?;

        self.step(
            DeclarationStep::AssociateContent,
            pid,
            self.api.put_set_declaration(&set, &ids.legacy, false),
        )
        .await?;
        self.step(
            DeclarationStep::AssociateActivation,
            pid,
            self.api.put_set_declaration(&set, &ids.activation, false),
        )
        .await?;
        self.step(
            DeclarationStep::SyncEnrollment,
            pid,
            self.api.put_enrollment_set(udid, &set, true),
        )
        .await?;

        info!(udid, profile = pid, "Profile declarations pushed");
        Ok(())
    }

    /// Removes one profile from one device, recomputing the push-time IDs.
    pub async fn delete_profile(&self, udid: &str, payload_identifier: &str) -> SyncResult<()> {
        validate_udid(udid)?;
        validate_payload_identifier(payload_identifier)?;

        let pid = payload_identifier;
        let ids = DeclarationIds::derive(&self.namespace, udid, pid);
        let set = device_set_name(&self.namespace, udid);

        self.remove(
            DeclarationStep::DissociateContent,
            pid,
            self.api.delete_set_declaration(&set, &ids.legacy, false),
        )
        .await?;
        self.remove(
            DeclarationStep::DissociateActivation,
            pid,
            self.api.delete_set_declaration(&set, &ids.activation, false),
        )
        .await?;
        self.remove(
            DeclarationStep::DeleteContent,
            pid,
            self.api.delete_declaration(&ids.legacy, false),
        )
        .await?;
        self.remove(
            DeclarationStep::DeleteActivation,
            pid,
            self.api.delete_declaration(&ids.activation, false),
        )
        .await?;
        self.step(
            DeclarationStep::SyncEnrollment,
            pid,
            self.api.put_enrollment_set(udid, &set, true),
        )
        .await?;

        info!(udid, profile = pid, "Profile declarations removed");
        Ok(())
    }

    async fn put_or_touch(
        &self,
        declaration: &Declaration,
        put: DeclarationStep,
        touch: DeclarationStep,
        profile: &str,
    ) -> SyncResult<()> {
        let outcome = self
            .step(put, profile, self.api.put_declaration(declaration, false))
            .await?;

        if outcome == PutOutcome::Unchanged {
            debug!(id = %declaration.identifier, "Declaration unchanged, touching");
            self.step(
                touch,
                profile,
                self.api.touch_declaration(&declaration.identifier, false),
            )
            .await?;
        }
        Ok(())
    }

    async fn step<T>(
        &self,
        step: DeclarationStep,
        profile: &str,
        call: impl Future<Output = SyncResult<T>>,
    ) -> SyncResult<T> {
        call.await.map_err(|err| SyncError::DeclarationStep {
            step,
            profile: profile.to_string(),
            source: Box::new(err),
        })
    }

    /// Like `step`, but a missing object counts as removed.
    async fn remove(
        &self,
        step: DeclarationStep,
        profile: &str,
        call: impl Future<Output = SyncResult<()>>,
    ) -> SyncResult<()> {
        self.step(step, profile, async {
            match call.await {
                Err(err) if err.is_not_found() => {
                    debug!(%step, profile, "Already removed");
                    Ok(())
                }
                other => other,
            }
        })
        .await
    }

    // =========================================================================
    // Bulk Operations
    // =========================================================================

    /// Pushes every installed device-specific profile of each device.
    pub async fn push_profiles(&self, udids: &[String]) -> SyncResult<BulkReport> {
        let mut report = BulkReport::default();

        for udid in udids {
            let profiles = match self.db.profiles().device_profiles(udid).await {
                Ok(profiles) => profiles,
                Err(err) => {
                    warn!(udid = %udid, error = %err, "Could not load device profiles");
                    report.attempted += 1;
                    report.failed += 1;
                    continue;
                }
            };

            for profile in profiles.iter().filter(|p| p.installed) {
                let outcome = self.push_profile(udid, profile).await;
                log_failure("push", udid, &profile.payload_identifier, &outcome);
                report.record(&outcome);
            }
        }

        info!(?report, "Device profile push complete");
        Ok(report)
    }

    /// Removes the given profiles from each device.
    pub async fn delete_profiles(
        &self,
        udids: &[String],
        payload_identifiers: &[String],
    ) -> SyncResult<BulkReport> {
        let mut report = BulkReport::default();

        for udid in udids {
            for pid in payload_identifiers {
                let outcome = self.delete_profile(udid, pid).await;
                log_failure("delete", udid, pid, &outcome);
                report.record(&outcome);
            }
        }

        info!(?report, "Device profile delete complete");
        Ok(report)
    }

    /// Pushes every installed shared profile to each device, except where
    /// a device-specific profile with the same identifier exists.
    pub async fn push_shared_profiles(&self, udids: &[String]) -> SyncResult<BulkReport> {
        let profiles = self.db.profiles().shared_profiles().await?;
        let mut report = BulkReport::default();

        for profile in profiles.iter().filter(|p| p.installed) {
            let skip = self.skip_set(&profile.payload_identifier).await?;

            for udid in udids {
                if skip.contains(udid) {
                    debug!(udid = %udid, profile = %profile.payload_identifier, "Device-specific profile wins");
                    report.skipped += 1;
                    continue;
                }

                let outcome = self.push_profile(udid, profile).await;
                log_failure("push shared", udid, &profile.payload_identifier, &outcome);
                report.record(&outcome);
            }
        }

        info!(?report, "Shared profile push complete");
        Ok(report)
    }

    /// Removes shared profiles from each device, leaving devices that own
    /// a device-specific profile with the same identifier alone.
    pub async fn delete_shared_profiles(
        &self,
        udids: &[String],
        payload_identifiers: &[String],
    ) -> SyncResult<BulkReport> {
        let mut report = BulkReport::default();

        for pid in payload_identifiers {
            let skip = self.skip_set(pid).await?;

            for udid in udids {
                if skip.contains(udid) {
                    report.skipped += 1;
                    continue;
                }

                let outcome = self.delete_profile(udid, pid).await;
                log_failure("delete shared", udid, pid, &outcome);
                report.record(&outcome);
            }
        }

        info!(?report, "Shared profile delete complete");
        Ok(report)
    }

    async fn skip_set(&self, payload_identifier: &str) -> SyncResult<HashSet<String>> {
        Ok(self
            .db
            .profiles()
            .udids_with_device_profile(payload_identifier)
            .await?)
    }
}

fn log_failure(operation: &str, udid: &str, profile: &str, outcome: &SyncResult<()>) {
    if let Err(err) = outcome {
        warn!(operation, udid, profile, error = %err, "Declaration sync failed, continuing");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
