//! Structural validation of the on-disk store.
//!
//! The validator never runs implicitly; normal reads and writes stay on
//! their fast paths. It walks every snapshot directory and reports where
//! the bookkeeping (manifest, metadata) disagrees with what is actually
//! on disk, so the recovery service can reconcile them.

use std::path::PathBuf;

use serde::Serialize;
use tracing::instrument;

use crate::path_guard::{self, MANIFEST_FILE, METADATA_FILE, RANKINGS_FILE};
use crate::{Error, RecordStatus, Result, SnapshotManifest, SnapshotMetadata};

/// The specific inconsistency found in a snapshot directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// No metadata file: the write never committed or the marker was lost.
    MissingMetadata,
    /// The metadata file exists but does not parse.
    UnreadableMetadata,
    /// No manifest file.
    MissingManifest,
    /// The manifest file exists but does not parse, or names a file
    /// outside the snapshot layout.
    UnreadableManifest,
    /// A file the manifest claims as successfully written is absent.
    MissingFile,
    /// A file's size on disk disagrees with the manifest.
    SizeMismatch,
    /// Metadata's success count disagrees with the manifest's.
    CountMismatch,
    /// A district file on disk that the manifest does not know about.
    OrphanedFile,
}

impl IssueKind {
    /// Structural issues mean committed data may be unreadable; the rest
    /// are bookkeeping drift.
    pub fn is_structural(self) -> bool {
        matches!(
            self,
            Self::MissingMetadata
                | Self::UnreadableMetadata
                | Self::MissingManifest
                | Self::UnreadableManifest
                | Self::MissingFile
        )
    }
}

/// One inconsistency in one snapshot directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityIssue {
    /// The snapshot the issue was found in.
    pub snapshot_id: String,
    /// What kind of inconsistency.
    pub kind: IssueKind,
    /// Human-readable detail.
    pub detail: String,
}

/// Overall verdict for the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreHealth {
    /// Every snapshot is internally consistent.
    Healthy,
    /// Bookkeeping drift only; all committed data is readable.
    Degraded,
    /// At least one snapshot has a structural problem.
    Corrupted,
}

/// Result of one full store walk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrityReport {
    /// How many snapshot directories were examined.
    pub checked_snapshots: usize,
    /// Every inconsistency found, in walk order (newest snapshot first).
    pub issues: Vec<IntegrityIssue>,
    /// Sorted, de-duplicated ids of affected snapshots.
    pub affected: Vec<String>,
    /// The overall verdict.
    pub health: StoreHealth,
}

impl IntegrityReport {
    /// Issues recorded for one snapshot.
    pub fn issues_for<'a>(&'a self, snapshot_id: &'a str) -> impl Iterator<Item = &'a IntegrityIssue> {
        self.issues
            .iter()
            .filter(move |issue| issue.snapshot_id == snapshot_id)
    }
}

enum Loaded<T> {
    Missing,
    Unreadable(String),
    Parsed(T),
}

/// Walks the store and reports structural inconsistencies.
pub struct IntegrityValidator {
    root: PathBuf,
}

impl IntegrityValidator {
    pub(crate) fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Examines every snapshot directory and produces a structured
    /// report with an overall health verdict.
    #[instrument(skip(self))]
    pub async fn validate(&self) -> Result<IntegrityReport> {
        let ids = path_guard::snapshot_dir_names(&self.root).await?;
        let mut issues = Vec::new();
        for id in &ids {
            self.validate_snapshot(id, &mut issues).await?;
        }

        let mut affected: Vec<String> = issues.iter().map(|i| i.snapshot_id.clone()).collect();
        affected.sort_unstable();
        affected.dedup();

        let health = if issues.iter().any(|i| i.kind.is_structural()) {
            StoreHealth::Corrupted
        } else if issues.is_empty() {
            StoreHealth::Healthy
        } else {
            StoreHealth::Degraded
        };

        Ok(IntegrityReport {
            checked_snapshots: ids.len(),
            issues,
            affected,
            health,
        })
    }

    async fn validate_snapshot(
        &self,
        snapshot_id: &str,
        issues: &mut Vec<IntegrityIssue>,
    ) -> Result<()> {
        let push = |issues: &mut Vec<IntegrityIssue>, kind, detail: String| {
            issues.push(IntegrityIssue {
                snapshot_id: snapshot_id.to_string(),
                kind,
                detail,
            });
        };

        let metadata = self.load::<SnapshotMetadata>(snapshot_id, METADATA_FILE).await?;
        match &metadata {
            Loaded::Missing => push(
                issues,
                IssueKind::MissingMetadata,
                "metadata.json is absent; the snapshot never committed".to_string(),
            ),
            Loaded::Unreadable(cause) => push(
                issues,
                IssueKind::UnreadableMetadata,
                format!("metadata.json does not parse: {cause}"),
            ),
            Loaded::Parsed(_) => {}
        }

        let manifest = self.load::<SnapshotManifest>(snapshot_id, MANIFEST_FILE).await?;
        match &manifest {
            Loaded::Missing => push(
                issues,
                IssueKind::MissingManifest,
                "manifest.json is absent".to_string(),
            ),
            Loaded::Unreadable(cause) => push(
                issues,
                IssueKind::UnreadableManifest,
                format!("manifest.json does not parse: {cause}"),
            ),
            Loaded::Parsed(manifest) => {
                self.check_manifest_files(snapshot_id, manifest, issues)
                    .await?;
            }
        }

        if let (Loaded::Parsed(meta), Loaded::Parsed(manifest)) = (&metadata, &manifest)
            && meta.success_count != manifest.success_count()
        {
            push(
                issues,
                IssueKind::CountMismatch,
                format!(
                    "metadata records {} successful districts, manifest records {}",
                    meta.success_count,
                    manifest.success_count()
                ),
            );
        }

        Ok(())
    }

    async fn check_manifest_files(
        &self,
        snapshot_id: &str,
        manifest: &SnapshotManifest,
        issues: &mut Vec<IntegrityIssue>,
    ) -> Result<()> {
        for (district_id, entry) in &manifest.districts {
            if entry.status != RecordStatus::Success {
                continue;
            }
            if path_guard::district_id_from_file_name(&entry.file) != Some(district_id.as_str()) {
                issues.push(IntegrityIssue {
                    snapshot_id: snapshot_id.to_string(),
                    kind: IssueKind::UnreadableManifest,
                    detail: format!(
                        "entry for district {district_id} names `{}`, which is not its record file",
                        entry.file
                    ),
                });
                continue;
            }
            match self.file_size(snapshot_id, &entry.file).await? {
                None => issues.push(IntegrityIssue {
                    snapshot_id: snapshot_id.to_string(),
                    kind: IssueKind::MissingFile,
                    detail: format!("district file `{}` is missing", entry.file),
                }),
                Some(size) if size != entry.size_bytes => issues.push(IntegrityIssue {
                    snapshot_id: snapshot_id.to_string(),
                    kind: IssueKind::SizeMismatch,
                    detail: format!(
                        "district file `{}` is {size} bytes on disk, manifest records {}",
                        entry.file, entry.size_bytes
                    ),
                }),
                Some(_) => {}
            }
        }

        if manifest.rankings.present {
            match self.file_size(snapshot_id, RANKINGS_FILE).await? {
                None => issues.push(IntegrityIssue {
                    snapshot_id: snapshot_id.to_string(),
                    kind: IssueKind::MissingFile,
                    detail: format!("rankings file `{RANKINGS_FILE}` is missing"),
                }),
                Some(size) if size != manifest.rankings.size_bytes => {
                    issues.push(IntegrityIssue {
                        snapshot_id: snapshot_id.to_string(),
                        kind: IssueKind::SizeMismatch,
                        detail: format!(
                            "rankings file is {size} bytes on disk, manifest records {}",
                            manifest.rankings.size_bytes
                        ),
                    });
                }
                Some(_) => {}
            }
        }

        for file in path_guard::district_files(&self.root, snapshot_id).await? {
            let known = manifest.districts.values().any(|entry| entry.file == file);
            if !known {
                issues.push(IntegrityIssue {
                    snapshot_id: snapshot_id.to_string(),
                    kind: IssueKind::OrphanedFile,
                    detail: format!("district file `{file}` is not in the manifest"),
                });
            }
        }

        Ok(())
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

    async fn load<T: serde::de::DeserializeOwned>(
        &self,
        snapshot_id: &str,
        file_name: &str,
    ) -> Result<Loaded<T>> {
        let Some(path) = path_guard::read_path(&self.root, snapshot_id, file_name).await? else {
            return Ok(Loaded::Missing);
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Loaded::Missing),
            Err(err) => return Err(Error::storage("read snapshot file", snapshot_id, err)),
        };
        Ok(match serde_json::from_slice(&bytes) {
            Ok(value) => Loaded::Parsed(value),
            Err(err) => Loaded::Unreadable(err.to_string()),
        })
    }
}
