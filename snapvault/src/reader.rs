//! The snapshot read path.
//!
//! Reads are served in three tiers: an in-memory TTL cache, an in-flight
//! map that collapses concurrent identical requests into one filesystem
//! operation, and finally the disk. Discovery of the latest successful
//! snapshot gates on the metadata commit marker, so a directory whose
//! write was interrupted before metadata landed is invisible here.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use tracing::{instrument, warn};

use crate::cache::{ReadCoalescer, TtlCell};
use crate::metrics::ReadMetrics;
use crate::path_guard::{self, MANIFEST_FILE, METADATA_FILE, RANKINGS_FILE};
use crate::{
    DistrictRecord, Error, RankingsData, RecordStatus, Result, SnapshotFilter, SnapshotManifest,
    SnapshotMetadata, SnapshotStatus,
};

/// Single-flight key for "the latest successful snapshot".
const CURRENT_KEY: &str = "current";

/// A fully assembled snapshot as read back from disk: the committed
/// metadata plus every district record the manifest could vouch for,
/// ordered by district id.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredSnapshot {
    /// The commit marker contents.
    pub metadata: SnapshotMetadata,
    /// District records, ordered by district id.
    pub districts: Vec<DistrictRecord>,
}

/// Serves single-snapshot and latest-successful reads with caching and
/// request coalescing. All state is per-instance; nothing is global.
pub struct SnapshotReader {
    inner: Arc<ReaderInner>,
}

struct ReaderInner {
    root: PathBuf,
    current: TtlCell<Arc<StoredSnapshot>>,
    listing: TtlCell<Arc<Vec<SnapshotMetadata>>>,
    inflight: ReadCoalescer<Option<Arc<StoredSnapshot>>>,
    metrics: Arc<ReadMetrics>,
}

impl SnapshotReader {
    pub(crate) fn new(
        root: PathBuf,
        current_ttl: Duration,
        listing_ttl: Duration,
        metrics: Arc<ReadMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(ReaderInner {
                root,
                current: TtlCell::new(current_ttl),
                listing: TtlCell::new(listing_ttl),
                inflight: ReadCoalescer::new(),
                metrics,
            }),
        }
    }

    /// The newest snapshot whose status is `success`, or `None` when the
    /// store has none.
    ///
    /// Served from the current-snapshot cache when fresh; otherwise at
    /// most one directory scan runs at a time and concurrent callers
    /// share its result. Snapshots with unreadable metadata are logged
    /// and skipped by the scan, never fatal.
    #[instrument(skip(self))]
    pub async fn latest_successful(&self) -> Result<Option<Arc<StoredSnapshot>>> {
        let _read = self.inner.metrics.begin();
        if let Some(snapshot) = self.inner.current.get() {
            self.inner.metrics.record_hit();
            return Ok(Some(snapshot));
        }
        self.inner.metrics.record_miss();

        let inner = Arc::clone(&self.inner);
        let (result, led) = self
            .inner
            .inflight
            .run(CURRENT_KEY, move || {
                async move {
                    let found = inner.scan_latest().await?;
                    if let Some(snapshot) = &found {
                        inner.current.put(Arc::clone(snapshot));
                    }
                    Ok(found)
                }
                .boxed()
            })
            .await;
        if !led {
            self.inner.metrics.record_coalesced();
        }
        result
    }

    /// One snapshot by id, with its district records, or `None` when not
    /// committed.
    #[instrument(skip(self))]
    pub async fn get(&self, snapshot_id: &str) -> Result<Option<Arc<StoredSnapshot>>> {
        path_guard::validate_snapshot_id(snapshot_id)?;
        let _read = self.inner.metrics.begin();

        if let Some(current) = self.inner.current.get()
            && current.metadata.snapshot_id == snapshot_id
        {
            self.inner.metrics.record_hit();
            return Ok(Some(current));
        }
        self.inner.metrics.record_miss();

        let inner = Arc::clone(&self.inner);
        let id = snapshot_id.to_string();
        let key = format!("snapshot:{snapshot_id}");
        let (result, led) = self
            .inner
            .inflight
            .run(&key, move || {
                async move { inner.load_stored(&id).await }.boxed()
            })
            .await;
        if !led {
            self.inner.metrics.record_coalesced();
        }
        result
    }

    /// Snapshot metadata, newest first by creation time, filtered and
    /// truncated after the listing is assembled. The listing itself is
    /// cached with its own TTL.
    #[instrument(skip(self, filter))]
    pub async fn list(
        &self,
        limit: Option<usize>,
        filter: Option<&SnapshotFilter>,
    ) -> Result<Vec<SnapshotMetadata>> {
        let _read = self.inner.metrics.begin();
        let listing = self.listing_cached().await?;
        let mut out: Vec<SnapshotMetadata> = listing
            .iter()
            .filter(|meta| filter.is_none_or(|f| f.matches(meta)))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    /// Ids of every committed snapshot, newest first.
    #[instrument(skip(self))]
    pub async fn list_ids(&self) -> Result<Vec<String>> {
        let _read = self.inner.metrics.begin();
        let mut ids = Vec::new();
        for id in path_guard::snapshot_dir_names(&self.inner.root).await? {
            if path_guard::read_path(&self.inner.root, &id, METADATA_FILE)
                .await?
                .is_some()
            {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// The commit marker for one snapshot, or `None`.
    pub async fn metadata(&self, snapshot_id: &str) -> Result<Option<SnapshotMetadata>> {
        let _read = self.inner.metrics.begin();
        self.inner
            .read_json(snapshot_id, METADATA_FILE, "metadata")
            .await
    }

    /// Metadata for several snapshots at once.
    ///
    /// When the listing cache is warm, ids it does not contain are
    /// answered as `None` without touching the filesystem and the rest
    /// are served from the cached listing; otherwise the ids are fetched
    /// concurrently.
    pub async fn metadata_batch(
        &self,
        ids: &[String],
    ) -> Result<Vec<(String, Option<SnapshotMetadata>)>> {
        let _read = self.inner.metrics.begin();
        let warm = self.inner.listing.get();
        let known: Option<HashMap<&str, &SnapshotMetadata>> = warm
            .as_deref()
            .map(|listing| listing.iter().map(|m| (m.snapshot_id.as_str(), m)).collect());

        let lookups = ids.iter().map(|id| {
            let cached = known.as_ref().map(|k| k.get(id.as_str()).copied());
            async move {
                match cached {
                    Some(Some(meta)) => Ok((id.clone(), Some(meta.clone()))),
                    Some(None) => Ok((id.clone(), None)),
                    None => self
                        .inner
                        .read_json(id, METADATA_FILE, "metadata")
                        .await
                        .map(|meta| (id.clone(), meta)),
                }
            }
        });
        futures::future::try_join_all(lookups).await
    }

    /// The per-snapshot file index, or `None`.
    pub async fn manifest(&self, snapshot_id: &str) -> Result<Option<SnapshotManifest>> {
        let _read = self.inner.metrics.begin();
        self.inner
            .read_json(snapshot_id, MANIFEST_FILE, "manifest")
            .await
    }

    /// One district's record within a snapshot, or `None`.
    pub async fn district_record(
        &self,
        snapshot_id: &str,
        district_id: &str,
    ) -> Result<Option<DistrictRecord>> {
        path_guard::validate_district_id(district_id)?;
        let _read = self.inner.metrics.begin();
        self.inner
            .read_json(
                snapshot_id,
                &path_guard::district_file_name(district_id),
                "district record",
            )
            .await
    }

    /// The aggregate rankings artifact, or `None`.
    pub async fn rankings(&self, snapshot_id: &str) -> Result<Option<RankingsData>> {
        let _read = self.inner.metrics.begin();
        self.inner
            .read_json(snapshot_id, RANKINGS_FILE, "rankings")
            .await
    }

    /// Whether a rankings artifact exists for the snapshot.
    pub async fn has_rankings(&self, snapshot_id: &str) -> Result<bool> {
        let _read = self.inner.metrics.begin();
        Ok(
            path_guard::read_path(&self.inner.root, snapshot_id, RANKINGS_FILE)
                .await?
                .is_some(),
        )
    }

    pub(crate) fn invalidate_current(&self) {
        self.inner.current.invalidate();
    }

    pub(crate) fn invalidate_listing(&self) {
        self.inner.listing.invalidate();
    }

    async fn listing_cached(&self) -> Result<Arc<Vec<SnapshotMetadata>>> {
        if let Some(listing) = self.inner.listing.get() {
            self.inner.metrics.record_hit();
            return Ok(listing);
        }
        self.inner.metrics.record_miss();
        let listing = Arc::new(self.inner.scan_listing().await?);
        self.inner.listing.put(Arc::clone(&listing));
        Ok(listing)
    }
}

impl ReaderInner {
    async fn scan_latest(&self) -> Result<Option<Arc<StoredSnapshot>>> {
        for id in path_guard::snapshot_dir_names(&self.root).await? {
            match self
                .read_json::<SnapshotMetadata>(&id, METADATA_FILE, "metadata")
                .await
            {
                Ok(Some(meta)) if meta.status == SnapshotStatus::Success => {
                    return Ok(Some(Arc::new(self.assemble(meta).await?)));
                }
                // Committed but not successful: keep scanning older dates.
                Ok(Some(_)) => {}
                // No commit marker: the directory is invisible.
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        snapshot_id = %id,
                        error = %err,
                        "skipping snapshot with unreadable metadata during discovery"
                    );
                }
            }
        }
        Ok(None)
    }

    async fn load_stored(&self, snapshot_id: &str) -> Result<Option<Arc<StoredSnapshot>>> {
        let Some(metadata) = self
            .read_json::<SnapshotMetadata>(snapshot_id, METADATA_FILE, "metadata")
            .await?
        else {
            return Ok(None);
        };
        Ok(Some(Arc::new(self.assemble(metadata).await?)))
    }

    /// Reads the district bodies for a committed snapshot.
    async fn assemble(&self, metadata: SnapshotMetadata) -> Result<StoredSnapshot> {
        let id = metadata.snapshot_id.clone();
        let files = match self
            .read_json::<SnapshotManifest>(&id, MANIFEST_FILE, "manifest")
            .await?
        {
            Some(manifest) => manifest
                .districts
                .values()
                .filter(|entry| entry.status == RecordStatus::Success)
                .map(|entry| entry.file.clone())
                .collect(),
            // Manifest missing: fall back to what is on disk so a
            // bookkeeping gap does not hide committed district data.
            None => path_guard::district_files(&self.root, &id).await?,
        };

        let mut districts = Vec::with_capacity(files.len());
        for file in files {
            match self
                .read_json::<DistrictRecord>(&id, &file, "district record")
                .await?
            {
                Some(record) => districts.push(record),
                None => warn!(
                    snapshot_id = %id,
                    file = %file,
                    "district file named by manifest is missing"
                ),
            }
        }
        districts.sort_by(|a, b| a.district_id.cmp(&b.district_id));
        Ok(StoredSnapshot {
            metadata,
            districts,
        })
    }

    async fn scan_listing(&self) -> Result<Vec<SnapshotMetadata>> {
        let mut listing = Vec::new();
        for id in path_guard::snapshot_dir_names(&self.root).await? {
            match self
                .read_json::<SnapshotMetadata>(&id, METADATA_FILE, "metadata")
                .await
            {
                Ok(Some(meta)) => listing.push(meta),
                Ok(None) => {}
                Err(err) => {
                    warn!(
                        snapshot_id = %id,
                        error = %err,
                        "skipping snapshot with unreadable metadata in listing"
                    );
                }
            }
        }
        listing.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(listing)
    }

    /// Reads and parses one JSON artifact. Absence is `Ok(None)`; a parse
    /// failure is a typed corruption error carrying the snapshot id.
    async fn read_json<T: DeserializeOwned>(
        &self,
        snapshot_id: &str,
        file_name: &str,
        artifact: &'static str,
    ) -> Result<Option<T>> {
        let Some(path) = path_guard::read_path(&self.root, snapshot_id, file_name).await? else {
            return Ok(None);
        };
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(Error::storage("read snapshot file", snapshot_id, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| Error::corrupt(snapshot_id, artifact, err))
    }
}
