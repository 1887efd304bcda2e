//! The store façade consumed by the snapshot builder and by read-side
//! reporting services.
//!
//! [`SnapshotStore`] composes the reader, writer, closing-period
//! decision, and integrity/recovery services over one root directory,
//! and owns the cross-cutting concerns: cache invalidation after writes
//! and deletes, and the read performance counters. Every piece of state
//! is per-instance; two stores over the same root share nothing but the
//! filesystem.
//!
//! The engine assumes a single writer process per store root. Readers
//! are safe alongside that writer without locks because a snapshot only
//! becomes discoverable once its metadata commit marker lands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::{instrument, warn};

use crate::closing_period::{self, UpdateDecision};
use crate::integrity::{IntegrityReport, IntegrityValidator};
use crate::metrics::{MetricsSnapshot, ReadMetrics};
use crate::path_guard;
use crate::reader::{SnapshotReader, StoredSnapshot};
use crate::recovery::{RecoveryGuidance, RecoveryOptions, RecoveryOutcome, RecoveryService};
use crate::writer::{SnapshotWriter, WriteOptions, WriteOutcome};
use crate::{
    DistrictRecord, Error, ManifestEntry, RankingsData, RankingsEntry, Result, Snapshot,
    SnapshotFilter, SnapshotManifest, SnapshotMetadata, SnapshotStatus,
};

/// Configuration for one store instance.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory of the store. Created if absent.
    pub root: PathBuf,
    /// How long a served "latest successful" snapshot stays fresh.
    pub current_ttl: Duration,
    /// How long a served snapshot listing stays fresh.
    pub listing_ttl: Duration,
    /// Districts a complete snapshot is expected to contain. When set,
    /// a write missing any of them commits as `partial`.
    pub expected_districts: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./snapshots"),
            current_ttl: Duration::from_secs(300),
            listing_ttl: Duration::from_secs(60),
            expected_districts: Vec::new(),
        }
    }
}

/// The snapshot storage engine's public contract.
pub struct SnapshotStore {
    reader: SnapshotReader,
    writer: SnapshotWriter,
    validator: IntegrityValidator,
    recovery: RecoveryService,
    metrics: Arc<ReadMetrics>,
}

impl SnapshotStore {
    /// Opens a store rooted at `config.root`, creating the directory if
    /// needed. The root is canonicalized once here so every later read
    /// path can be containment-checked against it.
    pub async fn open(config: StoreConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.root)
            .await
            .map_err(|err| Error::storage("create store root", "*", err))?;
        let root = tokio::fs::canonicalize(&config.root)
            .await
            .map_err(|err| Error::storage("resolve store root", "*", err))?;

        let metrics = Arc::new(ReadMetrics::default());
        Ok(Self {
            reader: SnapshotReader::new(
                root.clone(),
                config.current_ttl,
                config.listing_ttl,
                Arc::clone(&metrics),
            ),
            writer: SnapshotWriter::new(root.clone(), config.expected_districts),
            validator: IntegrityValidator::new(root.clone()),
            recovery: RecoveryService::new(root),
            metrics,
        })
    }

    // -- Write path --------------------------------------------------------

    /// Persists a snapshot via the ordered commit protocol and keeps the
    /// read caches coherent: every completed write invalidates the
    /// listing cache, and a `success` commit also invalidates the
    /// current-snapshot cache, since only those can change "latest
    /// successful".
    #[instrument(skip_all, fields(snapshot_id = %snapshot.snapshot_id))]
    pub async fn write_snapshot(
        &self,
        snapshot: &Snapshot,
        rankings: Option<&RankingsData>,
        options: &WriteOptions,
    ) -> Result<WriteOutcome> {
        let outcome = self.writer.write_snapshot(snapshot, rankings, options).await?;
        self.reader.invalidate_listing();
        if outcome.metadata.status == SnapshotStatus::Success {
            self.reader.invalidate_current();
        }
        Ok(outcome)
    }

    /// Persists one district's record, for callers that stream results
    /// in as collection completes. See
    /// [`SnapshotWriter::write_district_record`].
    pub async fn write_district_record(
        &self,
        snapshot_id: &str,
        record: &DistrictRecord,
    ) -> Result<ManifestEntry> {
        let entry = self.writer.write_district_record(snapshot_id, record).await?;
        self.reader.invalidate_listing();
        self.reader.invalidate_current();
        Ok(entry)
    }

    /// Persists the aggregate rankings artifact for a snapshot.
    pub async fn write_rankings(
        &self,
        snapshot_id: &str,
        rankings: &RankingsData,
    ) -> Result<RankingsEntry> {
        let entry = self.writer.write_rankings(snapshot_id, rankings).await?;
        self.reader.invalidate_listing();
        self.reader.invalidate_current();
        Ok(entry)
    }

    /// Removes a snapshot and everything under it. Returns whether
    /// anything existed.
    pub async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool> {
        let existed = self.writer.delete_snapshot(snapshot_id).await?;
        self.reader.invalidate_listing();
        self.reader.invalidate_current();
        Ok(existed)
    }

    // -- Read path ---------------------------------------------------------

    /// The newest snapshot whose status is `success`, or `None` when no
    /// data is available yet.
    pub async fn latest_successful(&self) -> Result<Option<Arc<StoredSnapshot>>> {
        self.reader.latest_successful().await
    }

    /// One snapshot by id, or `None` when not committed.
    pub async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<Arc<StoredSnapshot>>> {
        self.reader.get(snapshot_id).await
    }

    /// Snapshot metadata, newest first, optionally filtered and limited.
    pub async fn list_snapshots(
        &self,
        limit: Option<usize>,
        filter: Option<&SnapshotFilter>,
    ) -> Result<Vec<SnapshotMetadata>> {
        self.reader.list(limit, filter).await
    }

    /// Ids of every committed snapshot, newest first.
    pub async fn list_snapshot_ids(&self) -> Result<Vec<String>> {
        self.reader.list_ids().await
    }

    /// The per-snapshot file index, or `None`.
    pub async fn manifest(&self, snapshot_id: &str) -> Result<Option<SnapshotManifest>> {
        self.reader.manifest(snapshot_id).await
    }

    /// The commit marker for one snapshot, or `None`.
    pub async fn metadata(&self, snapshot_id: &str) -> Result<Option<SnapshotMetadata>> {
        self.reader.metadata(snapshot_id).await
    }

    /// Metadata for several snapshots at once; ids absent from a warm
    /// listing cache are answered without touching the filesystem.
    pub async fn metadata_batch(
        &self,
        snapshot_ids: &[String],
    ) -> Result<Vec<(String, Option<SnapshotMetadata>)>> {
        self.reader.metadata_batch(snapshot_ids).await
    }

    /// One district's record within a snapshot, or `None`.
    pub async fn district_record(
        &self,
        snapshot_id: &str,
        district_id: &str,
    ) -> Result<Option<DistrictRecord>> {
        self.reader.district_record(snapshot_id, district_id).await
    }

    /// The aggregate rankings artifact, or `None`.
    pub async fn rankings(&self, snapshot_id: &str) -> Result<Option<RankingsData>> {
        self.reader.rankings(snapshot_id).await
    }

    /// Whether a rankings artifact exists for the snapshot.
    pub async fn has_rankings(&self, snapshot_id: &str) -> Result<bool> {
        self.reader.has_rankings(snapshot_id).await
    }

    // -- Closing-period decision -------------------------------------------

    /// Decides whether data collected on `new_collection_date` should
    /// replace what is stored under `snapshot_id`.
    ///
    /// The stored side of the comparison is the snapshot's recorded
    /// collection date, falling back to its as-of date. Unreadable
    /// metadata fails open to "no existing snapshot" so a corrupt record
    /// cannot permanently block ingestion; an invalid id is still
    /// rejected before any I/O.
    #[instrument(skip(self))]
    pub async fn should_update(
        &self,
        snapshot_id: &str,
        new_collection_date: NaiveDate,
    ) -> Result<UpdateDecision> {
        path_guard::validate_snapshot_id(snapshot_id)?;
        let existing = match self.reader.metadata(snapshot_id).await {
            Ok(meta) => meta.and_then(|m| m.collection_date.or(m.as_of_date)),
            Err(err) => {
                warn!(
                    snapshot_id = %snapshot_id,
                    error = %err,
                    "treating unreadable metadata as no existing snapshot"
                );
                None
            }
        };
        Ok(closing_period::should_update(existing, new_collection_date))
    }

    // -- Integrity and recovery --------------------------------------------

    /// Walks the store and reports structural inconsistencies.
    pub async fn validate_integrity(&self) -> Result<IntegrityReport> {
        self.validator.validate().await
    }

    /// Validates, then applies corrective actions per `options`. The
    /// read caches are dropped afterwards since on-disk state may have
    /// changed underneath them.
    pub async fn recover_from_corruption(
        &self,
        options: &RecoveryOptions,
    ) -> Result<RecoveryOutcome> {
        let report = self.validator.validate().await?;
        let outcome = self.recovery.recover(&report, options).await?;
        self.reader.invalidate_listing();
        self.reader.invalidate_current();
        Ok(outcome)
    }

    /// The current integrity verdict plus ordered operator steps.
    pub async fn recovery_guidance(&self) -> Result<RecoveryGuidance> {
        self.recovery.guidance().await
    }

    // -- Observability -----------------------------------------------------

    /// Current read-path counters.
    pub fn performance_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Zeroes the read-path counters.
    pub fn reset_performance_metrics(&self) {
        self.metrics.reset();
    }
}
