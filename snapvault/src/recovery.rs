//! Corrective actions for a store the validator has flagged.
//!
//! Recovery reconciles bookkeeping with what is verifiably on disk: it
//! rebuilds manifests from the record files that survive a parse check,
//! rewrites metadata counts to match, and optionally quarantines the
//! originals aside first. It never fabricates district data. Rebuilding
//! a missing or unreadable commit marker is gated behind `force_recovery`
//! because that makes a previously invisible snapshot visible again and
//! cannot restore its closing-period provenance.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::integrity::{IntegrityIssue, IntegrityReport, IntegrityValidator, IssueKind, StoreHealth};
use crate::path_guard::{self, MANIFEST_FILE, METADATA_FILE, RANKINGS_FILE};
use crate::writer::write_json_atomic;
use crate::{
    DistrictRecord, Error, ManifestEntry, RankingsEntry, RecordStatus, Result, SnapshotManifest,
    SnapshotMetadata, SnapshotStatus,
};

/// Backups live under the store root; the directory name fails snapshot
/// id validation, so discovery and listing never see it.
const BACKUPS_DIR: &str = ".backups";

/// Knobs for [`RecoveryService::recover`].
#[derive(Debug, Clone, Copy)]
pub struct RecoveryOptions {
    /// Copy each affected snapshot directory aside before mutating it.
    pub create_backups: bool,
    /// Delete district record files that fail the parse sanity check
    /// instead of leaving them in place as orphans.
    pub remove_corrupted_files: bool,
    /// Allow rebuilding a missing or unreadable metadata commit marker.
    pub force_recovery: bool,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            create_backups: true,
            remove_corrupted_files: false,
            force_recovery: false,
        }
    }
}

/// What one recovery pass did.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryOutcome {
    /// Snapshots whose bookkeeping was rebuilt.
    pub recovered: Vec<String>,
    /// Snapshots left untouched because they need `force_recovery`.
    pub skipped: Vec<String>,
    /// Snapshots copied aside before mutation.
    pub backed_up: Vec<String>,
    /// Files removed, as `<snapshot_id>/<file>` strings.
    pub removed_files: Vec<String>,
    /// Issues still present after the pass, from a fresh validation.
    pub remaining: Vec<IntegrityIssue>,
}

/// How urgently an operator should act on the store's current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Nothing to do.
    Low,
    /// Bookkeeping drift; reconcile at leisure.
    Medium,
    /// Committed data is affected in at least one snapshot.
    High,
    /// A majority of snapshots are structurally damaged.
    Critical,
}

/// The current integrity verdict plus ordered manual steps for whatever
/// automated recovery cannot resolve.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryGuidance {
    /// Verdict from a fresh validation.
    pub health: StoreHealth,
    /// Recommended steps, in order.
    pub steps: Vec<String>,
    /// How urgently to act.
    pub urgency: Urgency,
}

/// Applies corrective actions guided by the validator's findings.
pub struct RecoveryService {
    root: PathBuf,
    validator: IntegrityValidator,
}

impl RecoveryService {
    pub(crate) fn new(root: PathBuf) -> Self {
        let validator = IntegrityValidator::new(root.clone());
        Self { root, validator }
    }

    /// Rebuilds bookkeeping for every snapshot the report flags.
    ///
    /// Snapshots whose commit marker is missing or unreadable are skipped
    /// unless `force_recovery` is set. The outcome includes the issues
    /// still present after the pass.
    #[instrument(skip(self, report), fields(affected = report.affected.len()))]
    pub async fn recover(
        &self,
        report: &IntegrityReport,
        options: &RecoveryOptions,
    ) -> Result<RecoveryOutcome> {
        let mut outcome = RecoveryOutcome {
            recovered: Vec::new(),
            skipped: Vec::new(),
            backed_up: Vec::new(),
            removed_files: Vec::new(),
            remaining: Vec::new(),
        };

        for snapshot_id in &report.affected {
            let marker_damaged = report.issues_for(snapshot_id).any(|issue| {
                matches!(
                    issue.kind,
                    IssueKind::MissingMetadata | IssueKind::UnreadableMetadata
                )
            });
            if marker_damaged && !options.force_recovery {
                warn!(
                    snapshot_id = %snapshot_id,
                    "commit marker is damaged; skipping without force_recovery"
                );
                outcome.skipped.push(snapshot_id.clone());
                continue;
            }

            if options.create_backups {
                self.backup_snapshot(snapshot_id).await?;
                outcome.backed_up.push(snapshot_id.clone());
            }

            let removed = self.rebuild_snapshot(snapshot_id, options).await?;
            outcome.removed_files.extend(removed);
            outcome.recovered.push(snapshot_id.clone());
            info!(snapshot_id = %snapshot_id, "snapshot bookkeeping rebuilt");
        }

        outcome.remaining = self.validator.validate().await?.issues;
        Ok(outcome)
    }

    /// A fresh integrity verdict with ordered operator steps and an
    /// urgency tier.
    #[instrument(skip(self))]
    pub async fn guidance(&self) -> Result<RecoveryGuidance> {
        let report = self.validator.validate().await?;

        let urgency = match report.health {
            StoreHealth::Healthy => Urgency::Low,
            StoreHealth::Degraded => Urgency::Medium,
            StoreHealth::Corrupted => {
                if report.affected.len() * 2 >= report.checked_snapshots.max(1) {
                    Urgency::Critical
                } else {
                    Urgency::High
                }
            }
        };

        let mut steps = Vec::new();
        if report.health == StoreHealth::Healthy {
            steps.push("No action required.".to_string());
        } else {
            steps.push(
                "Run recovery with create_backups enabled to reconcile manifests and metadata \
                 with the records on disk."
                    .to_string(),
            );
            let has = |kind: IssueKind| report.issues.iter().any(|issue| issue.kind == kind);
            if has(IssueKind::MissingMetadata) || has(IssueKind::UnreadableMetadata) {
                steps.push(
                    "Snapshots with a damaged commit marker need force_recovery to become \
                     visible again; prefer re-running ingestion for those dates, since \
                     closing-period provenance cannot be rebuilt from disk."
                        .to_string(),
                );
            }
            if has(IssueKind::MissingFile) {
                steps.push(
                    "Re-collect source data for districts whose record files are gone; \
                     recovery never fabricates district data."
                        .to_string(),
                );
            }
            if has(IssueKind::OrphanedFile) {
                steps.push(
                    "Orphaned district files that still parse will be re-adopted into the \
                     manifest; enable remove_corrupted_files to drop the ones that do not."
                        .to_string(),
                );
            }
        }

        Ok(RecoveryGuidance {
            health: report.health,
            steps,
            urgency,
        })
    }

    /// Rebuilds one snapshot's manifest and metadata from what is on
    /// disk. Returns the files removed along the way.
    async fn rebuild_snapshot(
        &self,
        snapshot_id: &str,
        options: &RecoveryOptions,
    ) -> Result<Vec<String>> {
        let dir = path_guard::snapshot_dir(&self.root, snapshot_id)?;
        let mut removed = Vec::new();

        // Survey the record files that actually parse.
        let mut entries: BTreeMap<String, ManifestEntry> = BTreeMap::new();
        for file in path_guard::district_files(&self.root, snapshot_id).await? {
            let path = dir.join(&file);
            let Some(district_id) = path_guard::district_id_from_file_name(&file) else {
                continue;
            };
            let district_id = district_id.to_string();
            let parses = match tokio::fs::read(&path).await {
                Ok(bytes) => serde_json::from_slice::<DistrictRecord>(&bytes).is_ok(),
                Err(_) => false,
            };
            if parses {
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|err| Error::storage("stat snapshot file", snapshot_id, err))?;
                entries.insert(
                    district_id,
                    ManifestEntry {
                        file,
                        status: RecordStatus::Success,
                        size_bytes: meta.len(),
                        modified_at: meta.modified().ok().map(chrono::DateTime::<Utc>::from),
                        error: None,
                    },
                );
            } else if options.remove_corrupted_files {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|err| Error::storage("remove corrupted file", snapshot_id, err))?;
                removed.push(format!("{snapshot_id}/{file}"));
            }
        }

        // Keep failed-district bookkeeping from the old manifest when it
        // is still readable; that history is not derivable from disk.
        let old_manifest = self.try_read::<SnapshotManifest>(snapshot_id, MANIFEST_FILE).await;
        if let Some(old) = &old_manifest {
            for (district_id, entry) in &old.districts {
                if entry.status == RecordStatus::Failed && !entries.contains_key(district_id) {
                    entries.insert(district_id.clone(), entry.clone());
                }
            }
        }

        let old_metadata = self.try_read::<SnapshotMetadata>(snapshot_id, METADATA_FILE).await;

        // Nothing usable and nothing committed: this is write debris, not
        // a snapshot. Remove the directory instead of materializing an
        // empty one.
        if entries.is_empty() && old_metadata.is_none() {
            tokio::fs::remove_dir_all(&dir)
                .await
                .map_err(|err| Error::storage("remove snapshot debris", snapshot_id, err))?;
            removed.push(format!("{snapshot_id}/"));
            return Ok(removed);
        }

        let rankings = match self.file_size(snapshot_id, RANKINGS_FILE).await? {
            Some(size_bytes) => RankingsEntry {
                present: true,
                size_bytes,
            },
            None => RankingsEntry::default(),
        };

        let manifest = SnapshotManifest {
            snapshot_id: snapshot_id.to_string(),
            generated_at: Utc::now(),
            districts: entries,
            rankings,
        };
        write_json_atomic(&dir.join(MANIFEST_FILE), &manifest)
            .await
            .map_err(|err| Error::storage("write manifest", snapshot_id, err))?;

        let success_count = manifest.success_count();
        let metadata = match old_metadata {
            Some(mut meta) => {
                meta.success_count = success_count;
                meta.district_count = meta.district_count.max(manifest.districts.len());
                if meta.status != SnapshotStatus::Failed {
                    meta.status = if manifest.failure_count() == 0
                        && success_count == meta.district_count
                    {
                        SnapshotStatus::Success
                    } else {
                        SnapshotStatus::Partial
                    };
                }
                meta
            }
            // Only reachable under force_recovery: re-create the commit
            // marker from the rebuilt manifest. Provenance is gone.
            None => SnapshotMetadata {
                snapshot_id: snapshot_id.to_string(),
                created_at: Utc::now(),
                schema_version: None,
                calculation_version: None,
                ranking_version: None,
                status: if manifest.failure_count() == 0 && success_count > 0 {
                    SnapshotStatus::Success
                } else {
                    SnapshotStatus::Partial
                },
                district_count: manifest.districts.len(),
                success_count,
                errors: vec![
                    "metadata rebuilt from on-disk records; collection provenance lost"
                        .to_string(),
                ],
                district_errors: Vec::new(),
                source_system: None,
                as_of_date: None,
                is_closing_period_data: false,
                collection_date: None,
                logical_date: None,
            },
        };
        write_json_atomic(&dir.join(METADATA_FILE), &metadata)
            .await
            .map_err(|err| Error::storage("write metadata", snapshot_id, err))?;

        Ok(removed)
    }

    /// Copies a snapshot directory under `.backups/`. Snapshot
    /// directories are flat, so a file-by-file copy suffices. An earlier
    /// backup of the same snapshot is replaced.
    async fn backup_snapshot(&self, snapshot_id: &str) -> Result<()> {
        let src = path_guard::snapshot_dir(&self.root, snapshot_id)?;
        let dst = self.root.join(BACKUPS_DIR).join(snapshot_id);
        let _ = tokio::fs::remove_dir_all(&dst).await;
        tokio::fs::create_dir_all(&dst)
            .await
            .map_err(|err| Error::storage("create backup directory", snapshot_id, err))?;

        let mut dir = tokio::fs::read_dir(&src)
            .await
            .map_err(|err| Error::storage("scan snapshot directory", snapshot_id, err))?;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    return Err(Error::storage("scan snapshot directory", snapshot_id, err));
                }
            };
            if !entry.file_type().await.map_or(false, |t| t.is_file()) {
                continue;
            }
            tokio::fs::copy(entry.path(), dst.join(entry.file_name()))
                .await
                .map_err(|err| Error::storage("copy backup file", snapshot_id, err))?;
        }
        Ok(())
    }

    async fn try_read<T: serde::de::DeserializeOwned>(
        &self,
        snapshot_id: &str,
        file_name: &str,
    ) -> Option<T> {
        let path = path_guard::read_path(&self.root, snapshot_id, file_name)
            .await
            .ok()??;
        let bytes = tokio::fs::read(&path).await.ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    async fn file_size(&self, snapshot_id: &str, file_name: &str) -> Result<Option<u64>> {
        let Some(path) = path_guard::read_path(&self.root, snapshot_id, file_name).await? else {
            return Ok(None);
        };
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(Error::storage("stat snapshot file", snapshot_id, err)),
        }
    }
}
