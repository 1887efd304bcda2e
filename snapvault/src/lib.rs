//! # Snapvault
//!
//! `snapvault` persists point-in-time "snapshots" of normalized district
//! performance results, one directory per calendar date, and serves them
//! back to reporting consumers with low-latency cached reads.
//!
//! ## Core concepts
//!
//! - **[`Snapshot`]**: the full set of district results assembled by the
//!   ingestion pipeline for one logical calendar date.
//! - **[`SnapshotManifest`]**: the per-snapshot index of which district
//!   files were written and with what outcome.
//! - **[`SnapshotMetadata`]**: the commit marker. A snapshot directory is
//!   visible to readers if and only if its metadata file exists, because
//!   the writer persists it last.
//! - **[`SnapshotStore`]**: the façade composing the read path (caching,
//!   request coalescing), the write path (ordered multi-file commit), the
//!   closing-period update decision, and integrity/recovery.
//!
//! ## Example
//!
//! ```rust,no_run
//! use snapvault::{Snapshot, SnapshotStore, StoreConfig, WriteOptions};
//!
//! async fn ingest(snapshot: Snapshot) -> snapvault::Result<()> {
//!     let store = SnapshotStore::open(StoreConfig {
//!         root: "./snapshots".into(),
//!         ..StoreConfig::default()
//!     })
//!     .await?;
//!
//!     store
//!         .write_snapshot(&snapshot, None, &WriteOptions::default())
//!         .await?;
//!
//!     let latest = store.latest_successful().await?;
//!     println!("latest: {:?}", latest.map(|s| s.metadata.snapshot_id.clone()));
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

mod cache;
pub mod closing_period;
pub mod integrity;
pub mod metrics;
pub mod path_guard;
pub mod reader;
pub mod recovery;
pub mod store;
pub mod writer;

pub use closing_period::{UpdateDecision, UpdateReason};
pub use integrity::{IntegrityIssue, IntegrityReport, IssueKind, StoreHealth};
pub use metrics::MetricsSnapshot;
pub use reader::StoredSnapshot;
pub use recovery::{RecoveryGuidance, RecoveryOptions, RecoveryOutcome, Urgency};
pub use store::{SnapshotStore, StoreConfig};
pub use writer::{WriteOptions, WriteOutcome};

/// The error type for this crate.
///
/// Absence is deliberately not represented here: read operations return
/// `Ok(None)` for anything that does not exist on disk. The variants are
/// string-backed so results can flow through shared, cloneable futures on
/// the coalesced read path.
#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
    /// A snapshot or district identifier contains characters outside its
    /// safe set. Rejected before any filesystem access.
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
    /// A resolved path escaped the store root, e.g. via a planted symlink.
    #[error("path for `{0}` escapes the store root")]
    PathTraversal(String),
    /// An I/O failure other than absence, with the failing operation and
    /// snapshot attached.
    #[error("{operation} failed for snapshot `{snapshot_id}`: {message}")]
    Storage {
        /// The store operation that failed.
        operation: &'static str,
        /// The snapshot the operation was acting on.
        snapshot_id: String,
        /// The underlying cause, stringified.
        message: String,
    },
    /// An on-disk artifact exists but does not parse.
    #[error("corrupt {artifact} in snapshot `{snapshot_id}`: {message}")]
    Corrupt {
        /// The snapshot holding the corrupt artifact.
        snapshot_id: String,
        /// Which file failed to parse.
        artifact: &'static str,
        /// The parse failure, stringified.
        message: String,
    },
}

impl Error {
    pub(crate) fn storage(
        operation: &'static str,
        snapshot_id: &str,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self::Storage {
            operation,
            snapshot_id: snapshot_id.to_string(),
            message: cause.to_string(),
        }
    }

    pub(crate) fn corrupt(
        snapshot_id: &str,
        artifact: &'static str,
        cause: impl std::fmt::Display,
    ) -> Self {
        Self::Corrupt {
            snapshot_id: snapshot_id.to_string(),
            artifact,
            message: cause.to_string(),
        }
    }
}

/// A specialized `Result` type for this crate's operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Overall outcome of one snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotStatus {
    /// Every configured district persisted.
    Success,
    /// Some districts failed to persist or were missing from the input.
    Partial,
    /// Upstream validation rejected the payload outright. The snapshot is
    /// still persisted so the failure is auditable.
    Failed,
}

/// Outcome of persisting a single district record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// The record file was written.
    Success,
    /// The record could not be written; see the manifest entry's error.
    Failed,
}

/// One persisted district result. The statistics payload is opaque to the
/// store beyond the identifier field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistrictRecord {
    /// District identifier, `[A-Za-z0-9]+`.
    pub district_id: String,
    /// Human-readable district name.
    pub district_name: String,
    /// When the source data for this district was collected.
    pub collected_at: DateTime<Utc>,
    /// Whether normalization produced usable statistics for this district.
    pub status: RecordStatus,
    /// Failure detail when `status` is not success.
    #[serde(default)]
    pub error: Option<String>,
    /// The normalized statistics payload, persisted verbatim.
    pub stats: serde_json::Value,
}

/// A structured per-district failure recorded in snapshot metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistrictError {
    /// The district that failed.
    pub district_id: String,
    /// The operation that failed, e.g. `write_record`.
    pub operation: String,
    /// Human-readable failure message.
    pub message: String,
    /// When the failure occurred.
    pub timestamp: DateTime<Utc>,
    /// Whether re-running collection for this district may succeed.
    pub retryable: bool,
}

/// The unit of persistence handed to the writer: all district results for
/// one logical calendar date, plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// ISO calendar date (`YYYY-MM-DD`) the data logically represents.
    /// Doubles as the directory name unless overridden at write time.
    pub snapshot_id: String,
    /// Compatibility tag for the on-disk record schema.
    #[serde(default)]
    pub schema_version: Option<String>,
    /// Compatibility tag for the statistics calculation.
    #[serde(default)]
    pub calculation_version: Option<String>,
    /// Compatibility tag for the ranking calculation.
    #[serde(default)]
    pub ranking_version: Option<String>,
    /// The upstream verdict. [`SnapshotStatus::Failed`] means validation
    /// rejected the data; otherwise the writer derives the final status
    /// from per-district outcomes.
    pub status: SnapshotStatus,
    /// Ordered human-readable failure strings from upstream processing.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Structured per-district failures from upstream processing.
    #[serde(default)]
    pub district_errors: Vec<DistrictError>,
    /// Per-district results, in source order.
    pub districts: Vec<DistrictRecord>,
    /// The system the raw extracts came from.
    #[serde(default)]
    pub source_system: Option<String>,
    /// The date the data is reported "as of".
    #[serde(default)]
    pub as_of_date: Option<NaiveDate>,
    /// Whether this data was collected during a closing period, in which
    /// case it may be re-collected several times as it stabilizes.
    #[serde(default)]
    pub is_closing_period_data: bool,
    /// The date this particular collection ran.
    #[serde(default)]
    pub collection_date: Option<NaiveDate>,
    /// The calendar date the data is considered to represent, when it
    /// differs from the collection date.
    #[serde(default)]
    pub logical_date: Option<NaiveDate>,
}

/// The per-snapshot commit marker, written last by the writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    /// Directory name of the snapshot.
    pub snapshot_id: String,
    /// When the write committed.
    pub created_at: DateTime<Utc>,
    /// See [`Snapshot::schema_version`].
    #[serde(default)]
    pub schema_version: Option<String>,
    /// See [`Snapshot::calculation_version`].
    #[serde(default)]
    pub calculation_version: Option<String>,
    /// See [`Snapshot::ranking_version`].
    #[serde(default)]
    pub ranking_version: Option<String>,
    /// Final status derived by the writer.
    pub status: SnapshotStatus,
    /// Number of districts attempted in the write.
    pub district_count: usize,
    /// Number of district record files that persisted successfully.
    pub success_count: usize,
    /// Ordered human-readable failure strings.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Structured per-district failures, upstream and write-time.
    #[serde(default)]
    pub district_errors: Vec<DistrictError>,
    /// See [`Snapshot::source_system`].
    #[serde(default)]
    pub source_system: Option<String>,
    /// See [`Snapshot::as_of_date`].
    #[serde(default)]
    pub as_of_date: Option<NaiveDate>,
    /// See [`Snapshot::is_closing_period_data`].
    #[serde(default)]
    pub is_closing_period_data: bool,
    /// See [`Snapshot::collection_date`].
    #[serde(default)]
    pub collection_date: Option<NaiveDate>,
    /// See [`Snapshot::logical_date`].
    #[serde(default)]
    pub logical_date: Option<NaiveDate>,
}

/// One manifest entry describing a district record file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// File name inside the snapshot directory.
    pub file: String,
    /// Whether the file was written successfully.
    pub status: RecordStatus,
    /// Size on disk, zero for failed entries.
    pub size_bytes: u64,
    /// Last-modified time of the file, when known.
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    /// Failure detail for failed entries.
    #[serde(default)]
    pub error: Option<String>,
}

/// Presence bookkeeping for the optional aggregate rankings artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RankingsEntry {
    /// Whether the rankings file was written for this snapshot.
    pub present: bool,
    /// Size on disk when present.
    pub size_bytes: u64,
}

/// The per-snapshot index of what was written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Directory name of the snapshot.
    pub snapshot_id: String,
    /// When the manifest was generated.
    pub generated_at: DateTime<Utc>,
    /// Per-district entries, keyed by district id.
    pub districts: BTreeMap<String, ManifestEntry>,
    /// Bookkeeping for the aggregate rankings artifact.
    #[serde(default)]
    pub rankings: RankingsEntry,
}

impl SnapshotManifest {
    /// Number of district entries that persisted successfully.
    pub fn success_count(&self) -> usize {
        self.districts
            .values()
            .filter(|e| e.status == RecordStatus::Success)
            .count()
    }

    /// Number of district entries that failed to persist.
    pub fn failure_count(&self) -> usize {
        self.districts.len() - self.success_count()
    }
}

/// Opaque aggregate rankings payload, persisted verbatim.
pub type RankingsData = serde_json::Value;

/// Criteria applied to [`SnapshotStore::list_snapshots`] results after the
/// listing is assembled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotFilter {
    /// Keep only snapshots with this status.
    pub status: Option<SnapshotStatus>,
    /// Keep only snapshots with this schema version tag.
    pub schema_version: Option<String>,
    /// Keep only snapshots created at or after this instant.
    pub created_after: Option<DateTime<Utc>>,
    /// Keep only snapshots created at or before this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// Keep only snapshots that attempted at least this many districts.
    pub min_district_count: Option<usize>,
}

impl SnapshotFilter {
    /// Whether a snapshot's metadata satisfies every configured criterion.
    pub fn matches(&self, metadata: &SnapshotMetadata) -> bool {
        if let Some(status) = self.status
            && metadata.status != status
        {
            return false;
        }
        if let Some(schema) = &self.schema_version
            && metadata.schema_version.as_deref() != Some(schema.as_str())
        {
            return false;
        }
        if let Some(after) = self.created_after
            && metadata.created_at < after
        {
            return false;
        }
        if let Some(before) = self.created_before
            && metadata.created_at > before
        {
            return false;
        }
        if let Some(min) = self.min_district_count
            && metadata.district_count < min
        {
            return false;
        }
        true
    }
}
