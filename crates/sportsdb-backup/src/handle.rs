//! Backup handles and their JSON manifests.

use crate::error::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sportsdb_core::ValidationReport;
use std::fs;
use std::path::{Path, PathBuf};

/// Extension of the manifest written next to each snapshot.
pub const MANIFEST_EXTENSION: &str = "json";

/// Attempts at suffixing a name before giving up.
const MAX_NAME_SUFFIX: u32 = 100;

/// A completed snapshot plus everything needed to restore and audit it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupHandle {
    /// Unique backup id; also the file stem of snapshot and manifest.
    pub id: String,
    /// Snapshot file.
    pub path: PathBuf,
    /// Database the snapshot was taken from.
    pub source: PathBuf,
    /// When the snapshot was taken.
    pub created_at: DateTime<Utc>,
    /// SHA-256 of the uncompressed database bytes, hex encoded.
    pub checksum: String,
    /// Whether the snapshot is gzip compressed.
    pub compressed: bool,
    /// Size of the uncompressed database in bytes.
    pub size_bytes: u64,
    /// Counters captured from the source at backup time.
    pub baseline: ValidationReport,
}

impl BackupHandle {
    /// Path of this handle's manifest.
    pub fn manifest_path(&self) -> PathBuf {
        manifest_path(self.directory(), &self.id)
    }

    /// Directory holding the snapshot.
    pub fn directory(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// Write the manifest next to the snapshot.
    pub fn save(&self) -> Result<PathBuf> {
        let path = self.manifest_path();
        let bytes = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }

    /// Read a manifest from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

pub(crate) fn manifest_path(directory: &Path, id: &str) -> PathBuf {
    directory.join(format!("{id}.{MANIFEST_EXTENSION}"))
}

/// Snapshot file name for a backup id.
pub(crate) fn snapshot_file_name(id: &str, compressed: bool) -> String {
    if compressed {
        format!("{id}.db.gz")
    } else {
        format!("{id}.db")
    }
}

/// Allocate a backup id of the form `<stem>-<YYYYmmddTHHMMSSmmmZ>`, adding a
/// `-NN` suffix when a backup with that name already exists in `directory`.
pub fn backup_name(directory: &Path, stem: &str, at: DateTime<Utc>) -> Result<String> {
    let base = format!("{stem}-{}", at.format("%Y%m%dT%H%M%S%3fZ"));
    let taken = |id: &str| {
        manifest_path(directory, id).exists()
            || directory.join(snapshot_file_name(id, false)).exists()
            || directory.join(snapshot_file_name(id, true)).exists()
    };

    if !taken(&base) {
        return Ok(base);
    }
    for suffix in 1..MAX_NAME_SUFFIX {
        let candidate = format!("{base}-{suffix:02}");
        if !taken(&candidate) {
            return Ok(candidate);
        }
    }
    Err(BackupError::NameCollision(directory.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_name_format() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 9, 1, 12, 30, 5).unwrap();
        let name = backup_name(dir.path(), "sports", at).unwrap();
        assert_eq!(name, "sports-20240901T123005000Z");
    }

    #[test]
    fn test_backup_name_suffixes_on_collision() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 9, 1, 12, 30, 5).unwrap();

        let first = backup_name(dir.path(), "sports", at).unwrap();
        fs::write(dir.path().join(snapshot_file_name(&first, false)), b"x").unwrap();
        let second = backup_name(dir.path(), "sports", at).unwrap();
        assert_eq!(second, format!("{first}-01"));

        fs::write(manifest_path(dir.path(), &second), b"{}").unwrap();
        let third = backup_name(dir.path(), "sports", at).unwrap();
        assert_eq!(third, format!("{first}-02"));
    }
}
