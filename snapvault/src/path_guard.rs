//! Identifier validation and store-root path containment.
//!
//! Every filesystem path the engine touches is built here. Identifiers are
//! checked against safe character sets before any I/O, write targets are
//! resolved lexically (they need not exist yet), and read targets are
//! resolved through symlinks to their real path, which must remain under
//! the store root.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Commit marker file name.
pub const METADATA_FILE: &str = "metadata.json";
/// Per-snapshot index file name.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Aggregate rankings file name.
pub const RANKINGS_FILE: &str = "all-districts-rankings.json";

/// File name for one district's record inside a snapshot directory.
pub fn district_file_name(district_id: &str) -> String {
    format!("district_{district_id}.json")
}

/// District id encoded in a record file name, if the name has the record
/// shape.
pub fn district_id_from_file_name(file_name: &str) -> Option<&str> {
    file_name
        .strip_prefix("district_")
        .and_then(|rest| rest.strip_suffix(".json"))
        .filter(|id| validate_district_id(id).is_ok())
}

/// Checks a snapshot id against `[A-Za-z0-9_-]+`.
pub fn validate_snapshot_id(id: &str) -> Result<()> {
    if !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(id.to_string()))
    }
}

/// Checks a district id against `[A-Za-z0-9]+`.
pub fn validate_district_id(id: &str) -> Result<()> {
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_alphanumeric()) {
        Ok(())
    } else {
        Err(Error::InvalidIdentifier(id.to_string()))
    }
}

/// Directory of one snapshot under the store root. Lexical only.
pub fn snapshot_dir(root: &Path, snapshot_id: &str) -> Result<PathBuf> {
    validate_snapshot_id(snapshot_id)?;
    Ok(root.join(snapshot_id))
}

/// Path of a file inside a snapshot directory, for writing. The target
/// need not exist, so lexical resolution after id validation is enough.
pub fn write_path(root: &Path, snapshot_id: &str, file_name: &str) -> Result<PathBuf> {
    Ok(snapshot_dir(root, snapshot_id)?.join(file_name))
}

/// Path of a file inside a snapshot directory, for reading.
///
/// Follows symlinks to the real path and verifies it is still under the
/// store root, so a link planted inside a snapshot directory cannot leak
/// files from elsewhere. The root must already be canonical, which
/// [`crate::SnapshotStore::open`] guarantees.
///
/// A missing file is a normal outcome and returns `Ok(None)`.
pub async fn read_path(
    root: &Path,
    snapshot_id: &str,
    file_name: &str,
) -> Result<Option<PathBuf>> {
    let candidate = write_path(root, snapshot_id, file_name)?;
    let real = match tokio::fs::canonicalize(&candidate).await {
        Ok(path) => path,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(Error::storage("resolve path", snapshot_id, err)),
    };
    if real.starts_with(root) {
        Ok(Some(real))
    } else {
        Err(Error::PathTraversal(format!("{snapshot_id}/{file_name}")))
    }
}

/// Directory names under the root that parse as snapshot ids, newest
/// first. ISO dates sort newest-first lexicographically, and anything
/// else living under the root (backups, temp directories) fails id
/// validation and is ignored.
pub(crate) async fn snapshot_dir_names(root: &Path) -> Result<Vec<String>> {
    let mut dir = match tokio::fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(Error::storage("scan store root", "*", err)),
    };
    let mut names = Vec::new();
    loop {
        let entry = match dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => return Err(Error::storage("scan store root", "*", err)),
        };
        if !entry.file_type().await.map_or(false, |t| t.is_dir()) {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && validate_snapshot_id(name).is_ok()
        {
            names.push(name.to_string());
        }
    }
    names.sort_unstable_by(|a, b| b.cmp(a));
    Ok(names)
}

/// Names of district record files present in a snapshot directory,
/// sorted. A missing directory yields an empty list.
pub(crate) async fn district_files(root: &Path, snapshot_id: &str) -> Result<Vec<String>> {
    let dir_path = snapshot_dir(root, snapshot_id)?;
    let mut dir = match tokio::fs::read_dir(&dir_path).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(Error::storage("scan snapshot directory", snapshot_id, err)),
    };
    let mut files = Vec::new();
    loop {
        let entry = match dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => return Err(Error::storage("scan snapshot directory", snapshot_id, err)),
        };
        if let Some(name) = entry.file_name().to_str()
            && district_id_from_file_name(name).is_some()
        {
            files.push(name.to_string());
        }
    }
    files.sort_unstable();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_ids_accept_dates_and_reject_traversal() {
        assert!(validate_snapshot_id("2024-01-31").is_ok());
        assert!(validate_snapshot_id("backfill_2024-01-31").is_ok());

        for bad in ["", "..", "../etc", "2024/01/31", "2024-01-31\n", "a b"] {
            assert!(
                matches!(validate_snapshot_id(bad), Err(Error::InvalidIdentifier(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn district_ids_are_alphanumeric_only() {
        assert!(validate_district_id("d42").is_ok());
        for bad in ["", "d-42", "d_42", "d 42", "../d42"] {
            assert!(validate_district_id(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn record_file_names_round_trip() {
        assert_eq!(district_id_from_file_name("district_d42.json"), Some("d42"));
        assert_eq!(district_id_from_file_name("metadata.json"), None);
        assert_eq!(district_id_from_file_name("district_.json"), None);
        assert_eq!(district_id_from_file_name("district_a-b.json"), None);
    }

    #[tokio::test]
    async fn read_path_reports_absence_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let resolved = read_path(&root, "2024-01-01", METADATA_FILE).await.unwrap();
        assert!(resolved.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn read_path_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.json");
        std::fs::write(&secret, b"{}").unwrap();

        let snapshot = root.join("2024-01-01");
        std::fs::create_dir_all(&snapshot).unwrap();
        std::os::unix::fs::symlink(&secret, snapshot.join(METADATA_FILE)).unwrap();

        let err = read_path(&root, "2024-01-01", METADATA_FILE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PathTraversal(_)));
    }
}
