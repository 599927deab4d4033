//! Runner configuration.

use sportsdb_backup::{BackupConfig, DEFAULT_BACKUP_DIR};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the run artifact when none is configured.
pub const DEFAULT_RESULTS_FILE: &str = "migration_results.json";

/// How long a connection waits on a locked database.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Migration runner configuration.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Database file.
    pub db_path: PathBuf,
    /// Where snapshots are written.
    pub backup_dir: PathBuf,
    /// Run read-only validators only.
    pub dry_run: bool,
    /// Gzip snapshots.
    pub compress_backups: bool,
    /// Where the run artifact is written.
    pub results_path: PathBuf,
    /// Whether to write the run artifact at all.
    pub write_results: bool,
    /// Busy timeout for database connections.
    pub busy_timeout: Duration,
}

impl MigrationConfig {
    /// Configuration for a database, with backups and results next to it.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        let db_path = db_path.into();
        let dir = db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            backup_dir: dir.join(DEFAULT_BACKUP_DIR),
            results_path: dir.join(DEFAULT_RESULTS_FILE),
            db_path,
            dry_run: false,
            compress_backups: false,
            write_results: true,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Set the backup directory.
    pub fn with_backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    /// Enable or disable dry-run mode.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Enable or disable snapshot compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_backups = compress;
        self
    }

    /// Set the run artifact path.
    pub fn with_results_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.results_path = path.into();
        self
    }

    /// Enable or disable writing the run artifact.
    pub fn with_results(mut self, write: bool) -> Self {
        self.write_results = write;
        self
    }

    /// Set the connection busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Backup configuration derived from this one.
    pub fn backup_config(&self) -> BackupConfig {
        BackupConfig::new(&self.backup_dir)
            .with_compression(self.compress_backups)
            .with_busy_timeout(self.busy_timeout)
    }
}
