//! The snapshot write path.
//!
//! A snapshot is a directory of files committed in a fixed order: the
//! directory itself, one record file per district, the optional rankings
//! artifact, the manifest, and the metadata file last. Metadata is the
//! commit marker; until it lands the directory is invisible to readers,
//! which is the engine's sole consistency mechanism. Manifest and
//! metadata are written via temp file plus atomic rename so a crash
//! mid-write cannot leave a truncated commit marker behind.

use std::collections::{BTreeMap, BTreeSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::path_guard::{self, MANIFEST_FILE, METADATA_FILE, RANKINGS_FILE, district_file_name};
use crate::{
    DistrictError, DistrictRecord, Error, ManifestEntry, RankingsData, RankingsEntry,
    RecordStatus, Result, Snapshot, SnapshotManifest, SnapshotMetadata, SnapshotStatus,
};

/// Options for one snapshot write.
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Store the snapshot under this directory name instead of the
    /// snapshot's own id. Used for closing-period remapping, where data
    /// collected on one date is stored under the calendar date it
    /// logically represents.
    pub override_date: Option<String>,
}

/// What one snapshot write committed.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// The metadata persisted as the commit marker.
    pub metadata: SnapshotMetadata,
    /// The manifest persisted alongside it.
    pub manifest: SnapshotManifest,
    /// Districts whose record files could not be written.
    pub failed_districts: Vec<String>,
}

/// Persists snapshots, individual district records, rankings artifacts,
/// and deletions.
pub struct SnapshotWriter {
    root: PathBuf,
    expected_districts: Vec<String>,
}

impl SnapshotWriter {
    pub(crate) fn new(root: PathBuf, expected_districts: Vec<String>) -> Self {
        Self {
            root,
            expected_districts,
        }
    }

    /// Persists a snapshot as a directory of files.
    ///
    /// One district's failure never aborts the others; it is recorded as
    /// a `failed` manifest entry and folded into the derived status. A
    /// snapshot whose upstream status is already `failed` is persisted
    /// as-is so the failure stays auditable.
    #[instrument(skip(self, snapshot, rankings), fields(snapshot_id = %snapshot.snapshot_id))]
    pub async fn write_snapshot(
        &self,
        snapshot: &Snapshot,
        rankings: Option<&RankingsData>,
        options: &WriteOptions,
    ) -> Result<WriteOutcome> {
        let dir_id = options
            .override_date
            .as_deref()
            .unwrap_or(&snapshot.snapshot_id);
        let dir = path_guard::snapshot_dir(&self.root, dir_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| Error::storage("create snapshot directory", dir_id, err))?;

        let mut entries = BTreeMap::new();
        let mut district_errors = snapshot.district_errors.clone();
        let mut failed_districts = Vec::new();
        for record in &snapshot.districts {
            match self.write_record_file(&dir, dir_id, record).await {
                Ok(entry) => {
                    entries.insert(record.district_id.clone(), entry);
                }
                Err(err) => {
                    failed_districts.push(record.district_id.clone());
                    district_errors.push(DistrictError {
                        district_id: record.district_id.clone(),
                        operation: "write_record".to_string(),
                        message: err.to_string(),
                        timestamp: Utc::now(),
                        retryable: true,
                    });
                    entries.insert(
                        record.district_id.clone(),
                        ManifestEntry {
                            file: district_file_name(&record.district_id),
                            status: RecordStatus::Failed,
                            size_bytes: 0,
                            modified_at: None,
                            error: Some(err.to_string()),
                        },
                    );
                }
            }
        }

        let rankings_entry = match rankings {
            Some(data) => {
                let size = write_json(&dir.join(RANKINGS_FILE), data)
                    .await
                    .map_err(|err| Error::storage("write rankings", dir_id, err))?;
                RankingsEntry {
                    present: true,
                    size_bytes: size,
                }
            }
            None => RankingsEntry::default(),
        };

        let manifest = SnapshotManifest {
            snapshot_id: dir_id.to_string(),
            generated_at: Utc::now(),
            districts: entries,
            rankings: rankings_entry,
        };
        write_json_atomic(&dir.join(MANIFEST_FILE), &manifest)
            .await
            .map_err(|err| Error::storage("write manifest", dir_id, err))?;

        let success_count = manifest.success_count();
        let status = self.derive_status(snapshot, success_count);
        let metadata = SnapshotMetadata {
            snapshot_id: dir_id.to_string(),
            created_at: Utc::now(),
            schema_version: snapshot.schema_version.clone(),
            calculation_version: snapshot.calculation_version.clone(),
            ranking_version: snapshot.ranking_version.clone(),
            status,
            district_count: snapshot.districts.len(),
            success_count,
            errors: snapshot.errors.clone(),
            district_errors,
            source_system: snapshot.source_system.clone(),
            as_of_date: snapshot.as_of_date,
            is_closing_period_data: snapshot.is_closing_period_data,
            collection_date: snapshot.collection_date,
            logical_date: snapshot.logical_date,
        };

        // Commit point: metadata lands last, atomically.
        write_json_atomic(&dir.join(METADATA_FILE), &metadata)
            .await
            .map_err(|err| Error::storage("write metadata", dir_id, err))?;

        debug!(snapshot_id = %dir_id, ?status, success_count, "snapshot committed");
        Ok(WriteOutcome {
            metadata,
            manifest,
            failed_districts,
        })
    }

    /// Writes one district's record outside a full snapshot write, for
    /// callers that stream district data in as it becomes available.
    ///
    /// If a manifest already exists its entry is upserted so bookkeeping
    /// stays consistent; otherwise the manifest arrives with the final
    /// [`Self::write_snapshot`] or a recovery rebuild.
    #[instrument(skip(self, record), fields(district_id = %record.district_id))]
    pub async fn write_district_record(
        &self,
        snapshot_id: &str,
        record: &DistrictRecord,
    ) -> Result<ManifestEntry> {
        let dir = path_guard::snapshot_dir(&self.root, snapshot_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| Error::storage("create snapshot directory", snapshot_id, err))?;
        let entry = self.write_record_file(&dir, snapshot_id, record).await?;
        let upserted = entry.clone();
        self.upsert_manifest(&dir, snapshot_id, move |manifest| {
            manifest
                .districts
                .insert(record.district_id.clone(), upserted);
        })
        .await?;
        Ok(entry)
    }

    /// Writes the aggregate rankings artifact for a snapshot.
    #[instrument(skip(self, rankings))]
    pub async fn write_rankings(
        &self,
        snapshot_id: &str,
        rankings: &RankingsData,
    ) -> Result<RankingsEntry> {
        let dir = path_guard::snapshot_dir(&self.root, snapshot_id)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|err| Error::storage("create snapshot directory", snapshot_id, err))?;
        let size = write_json(&dir.join(RANKINGS_FILE), rankings)
            .await
            .map_err(|err| Error::storage("write rankings", snapshot_id, err))?;
        let entry = RankingsEntry {
            present: true,
            size_bytes: size,
        };
        self.upsert_manifest(&dir, snapshot_id, move |manifest| {
            manifest.rankings = entry;
        })
        .await?;
        Ok(entry)
    }

    /// Removes a snapshot directory recursively. Returns whether anything
    /// existed.
    #[instrument(skip(self))]
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool> {
        let dir = path_guard::snapshot_dir(&self.root, snapshot_id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::storage("delete snapshot", snapshot_id, err)),
        }
    }

    async fn write_record_file(
        &self,
        dir: &Path,
        snapshot_id: &str,
        record: &DistrictRecord,
    ) -> Result<ManifestEntry> {
        path_guard::validate_district_id(&record.district_id)?;
        let file = district_file_name(&record.district_id);
        let path = dir.join(&file);
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|err| Error::storage("serialize district record", snapshot_id, err))?;
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|err| Error::storage("write district record", snapshot_id, err))?;
        let modified_at = tokio::fs::metadata(&path)
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .map(DateTime::<Utc>::from);
        Ok(ManifestEntry {
            file,
            status: RecordStatus::Success,
            size_bytes: bytes.len() as u64,
            modified_at,
            error: None,
        })
    }

    async fn upsert_manifest(
        &self,
        dir: &Path,
        snapshot_id: &str,
        apply: impl FnOnce(&mut SnapshotManifest),
    ) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let mut manifest: SnapshotManifest = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|err| Error::corrupt(snapshot_id, "manifest", err))?,
            // No bookkeeping yet; the snapshot write will produce it.
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(Error::storage("read manifest", snapshot_id, err)),
        };
        apply(&mut manifest);
        manifest.generated_at = Utc::now();
        write_json_atomic(&path, &manifest)
            .await
            .map(|_| ())
            .map_err(|err| Error::storage("write manifest", snapshot_id, err))
    }

    /// `success` only when every attempted district persisted and nothing
    /// the store is configured to expect is missing from the input. An
    /// upstream `failed` verdict is preserved untouched.
    fn derive_status(&self, snapshot: &Snapshot, success_count: usize) -> SnapshotStatus {
        if snapshot.status == SnapshotStatus::Failed {
            return SnapshotStatus::Failed;
        }
        let attempted: BTreeSet<&str> = snapshot
            .districts
            .iter()
            .map(|d| d.district_id.as_str())
            .collect();
        let missing_expected = self
            .expected_districts
            .iter()
            .any(|district| !attempted.contains(district.as_str()));
        if success_count == snapshot.districts.len() && !missing_expected {
            SnapshotStatus::Success
        } else {
            SnapshotStatus::Partial
        }
    }
}

/// Serializes `value` and writes it in place. Used for district records
/// and rankings, which precede the commit marker.
pub(crate) async fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<u64> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err))?;
    tokio::fs::write(path, &bytes).await?;
    Ok(bytes.len() as u64)
}

/// Temp file plus atomic rename, so a reader can never observe a
/// truncated manifest or metadata file.
pub(crate) async fn write_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
) -> std::io::Result<u64> {
    let bytes = serde_json::to_vec_pretty(value)
        .map_err(|err| std::io::Error::new(ErrorKind::InvalidData, err))?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(bytes.len() as u64)
}
