//! Backup error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while snapshotting or restoring a database.
#[derive(Debug, Error)]
pub enum BackupError {
    /// The database file to snapshot does not exist.
    #[error("source database not found: {}", .0.display())]
    SourceMissing(PathBuf),

    /// The database is held by another writer.
    #[error("source database is locked: {}: {reason}", path.display())]
    SourceLocked {
        /// Database path.
        path: PathBuf,
        /// What reported the lock.
        reason: String,
    },

    /// No free snapshot name for this timestamp.
    #[error("could not allocate a backup name under {}", .0.display())]
    NameCollision(PathBuf),

    /// No manifest with this id.
    #[error("backup not found: {0}")]
    NotFound(String),

    /// Snapshot contents do not match the recorded checksum.
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        /// Snapshot path.
        path: PathBuf,
        /// Checksum recorded at backup time.
        expected: String,
        /// Checksum of the snapshot now.
        actual: String,
    },

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Manifest (de)serialization error.
    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Result type for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;
