//! Snapshot creation and atomic restore.

use crate::error::{BackupError, Result};
use crate::handle::{backup_name, snapshot_file_name, BackupHandle, MANIFEST_EXTENSION};
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use sha2::{Digest, Sha256};
use sportsdb_core::ValidationReport;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Directory name used when no backup directory is configured.
pub const DEFAULT_BACKUP_DIR: &str = "backups";

/// Suffix of the temporary file a restore writes before renaming.
pub const RESTORE_SUFFIX: &str = ".restore-tmp";

const SIDECARS: [&str; 3] = ["-wal", "-shm", "-journal"];

/// Backup configuration.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Where snapshots and manifests are written.
    pub directory: PathBuf,
    /// Gzip snapshots.
    pub compress: bool,
    /// How long to wait on a busy database before reporting it locked.
    pub busy_timeout: Duration,
}

impl BackupConfig {
    /// Create a configuration writing into `directory`.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            compress: false,
            busy_timeout: Duration::from_secs(5),
        }
    }

    /// Default configuration for a database: `<db dir>/backups`.
    pub fn for_database(db_path: &Path) -> Self {
        let parent = db_path.parent().unwrap_or_else(|| Path::new("."));
        Self::new(parent.join(DEFAULT_BACKUP_DIR))
    }

    /// Enable or disable gzip compression.
    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Set the busy timeout.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }
}

/// Creates, lists, verifies and restores database snapshots.
pub struct BackupManager {
    config: BackupConfig,
}

impl BackupManager {
    /// Create a manager with the given configuration.
    pub fn new(config: BackupConfig) -> Self {
        Self { config }
    }

    /// The active configuration.
    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    /// Snapshot the database at `db_path`.
    ///
    /// The WAL is checkpointed first and the copy is taken under a read
    /// transaction, so the snapshot and its baseline counters agree.
    pub fn create_backup(&self, db_path: &Path) -> Result<BackupHandle> {
        if !db_path.is_file() {
            return Err(BackupError::SourceMissing(db_path.to_path_buf()));
        }
        fs::create_dir_all(&self.config.directory)?;

        let conn = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.config.busy_timeout)?;

        checkpoint(&conn, db_path)?;
        conn.execute_batch("BEGIN").map_err(|e| classify(db_path, e))?;
        let result = self.snapshot_locked(&conn, db_path);
        if let Err(e) = conn.execute_batch("COMMIT") {
            warn!(database = %db_path.display(), error = %e, "Failed to end backup read transaction");
        }
        result
    }

    fn snapshot_locked(&self, conn: &Connection, db_path: &Path) -> Result<BackupHandle> {
        let baseline = ValidationReport::capture(conn).map_err(|e| classify(db_path, e))?;

        let created_at = Utc::now();
        let stem = db_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("database");
        let id = backup_name(&self.config.directory, stem, created_at)?;
        let path = self
            .config
            .directory
            .join(snapshot_file_name(&id, self.config.compress));

        let (checksum, size_bytes) = write_snapshot(db_path, &path, self.config.compress)?;

        let handle = BackupHandle {
            id,
            path,
            source: db_path.to_path_buf(),
            created_at,
            checksum,
            compressed: self.config.compress,
            size_bytes,
            baseline,
        };
        handle.save()?;

        info!(
            backup = %handle.id,
            path = %handle.path.display(),
            size_bytes = handle.size_bytes,
            compressed = handle.compressed,
            tables = handle.baseline.row_counts.len(),
            "Backup created"
        );
        Ok(handle)
    }

    /// Recompute the checksum of a snapshot without touching the database.
    pub fn verify(&self, handle: &BackupHandle) -> Result<()> {
        let reader = open_snapshot(handle)?;
        let (actual, _, _) = copy_hashed(reader, io::sink())?;
        check_digest(handle, actual)
    }

    /// Restore a snapshot over its source database.
    ///
    /// All connections to the database must be closed first.
    pub fn restore(&self, handle: &BackupHandle) -> Result<()> {
        self.restore_to(handle, &handle.source)
    }

    /// Restore a snapshot over `target`.
    ///
    /// The snapshot is expanded into `<target>.restore-tmp`, checked against
    /// the recorded checksum, synced, and renamed over the target. Stale
    /// `-wal`, `-shm` and `-journal` files are removed before the rename.
    pub fn restore_to(&self, handle: &BackupHandle, target: &Path) -> Result<()> {
        let tmp = with_suffix(target, RESTORE_SUFFIX);
        let reader = open_snapshot(handle)?;

        let written = File::create(&tmp).and_then(|file| copy_hashed(reader, file));
        let (actual, bytes, file) = match written {
            Ok(done) => done,
            Err(e) => {
                let _ = fs::remove_file(&tmp);
                return Err(e.into());
            }
        };
        if let Err(e) = check_digest(handle, actual) {
            drop(file);
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        file.sync_all()?;
        drop(file);

        for suffix in SIDECARS {
            let sidecar = with_suffix(target, suffix);
            if sidecar.exists() {
                fs::remove_file(&sidecar)?;
                debug!(path = %sidecar.display(), "Removed stale sidecar");
            }
        }
        fs::rename(&tmp, target)?;

        info!(
            backup = %handle.id,
            target = %target.display(),
            bytes,
            "Backup restored"
        );
        Ok(())
    }

    /// All manifests in the backup directory, oldest first.
    pub fn list(&self) -> Result<Vec<BackupHandle>> {
        let dir = &self.config.directory;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut handles = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(MANIFEST_EXTENSION) {
                continue;
            }
            match BackupHandle::load(&path) {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable manifest"),
            }
        }
        handles.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(handles)
    }
}

/// Flush the WAL into the main file so a plain copy is complete.
fn checkpoint(conn: &Connection, db_path: &Path) -> Result<()> {
    let busy: i64 = conn
        .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| row.get(0))
        .map_err(|e| classify(db_path, e))?;
    if busy != 0 {
        return Err(BackupError::SourceLocked {
            path: db_path.to_path_buf(),
            reason: "wal checkpoint blocked by another connection".to_string(),
        });
    }
    Ok(())
}

fn classify(db_path: &Path, err: rusqlite::Error) -> BackupError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            BackupError::SourceLocked {
                path: db_path.to_path_buf(),
                reason: err.to_string(),
            }
        }
        _ => err.into(),
    }
}

fn write_snapshot(src: &Path, dest: &Path, compress: bool) -> Result<(String, u64)> {
    let reader = File::open(src)?;
    let file = File::create(dest)?;
    if compress {
        let encoder = GzEncoder::new(file, Compression::default());
        let (digest, bytes, encoder) = copy_hashed(reader, encoder)?;
        encoder.finish()?.sync_all()?;
        Ok((digest, bytes))
    } else {
        let (digest, bytes, file) = copy_hashed(reader, file)?;
        file.sync_all()?;
        Ok((digest, bytes))
    }
}

fn open_snapshot(handle: &BackupHandle) -> Result<Box<dyn Read>> {
    let file = match File::open(&handle.path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(BackupError::NotFound(handle.id.clone()))
        }
        Err(e) => return Err(e.into()),
    };
    if handle.compressed {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn check_digest(handle: &BackupHandle, actual: String) -> Result<()> {
    if actual != handle.checksum {
        return Err(BackupError::ChecksumMismatch {
            path: handle.path.clone(),
            expected: handle.checksum.clone(),
            actual,
        });
    }
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = OsString::from(path.as_os_str());
    os.push(suffix);
    PathBuf::from(os)
}

/// A writer that hashes everything passing through it.
struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Copy `reader` into `writer`, returning the hex SHA-256 of the bytes,
/// their count, and the writer.
fn copy_hashed<R: Read, W: Write>(mut reader: R, writer: W) -> io::Result<(String, u64, W)> {
    let mut hashing = HashingWriter {
        inner: writer,
        hasher: Sha256::new(),
        written: 0,
    };
    io::copy(&mut reader, &mut hashing)?;
    hashing.flush()?;
    let digest = hex::encode(hashing.hasher.finalize());
    Ok((digest, hashing.written, hashing.inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sportsdb_core::schema::row_count;

    struct TestContext {
        db: PathBuf,
        _dir: tempfile::TempDir,
    }

    impl TestContext {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let db = dir.path().join("sports.db");
            let conn = Connection::open(&db).unwrap();
            conn.execute_batch(
                "CREATE TABLE teams (id TEXT PRIMARY KEY, name TEXT NOT NULL);
                 INSERT INTO teams VALUES ('bal-ravens', 'Ravens'), ('pit-steelers', 'Steelers');",
            )
            .unwrap();
            Self { db, _dir: dir }
        }

        fn manager(&self, compress: bool) -> BackupManager {
            BackupManager::new(BackupConfig::for_database(&self.db).with_compression(compress))
        }

        fn teams(&self) -> i64 {
            let conn = Connection::open(&self.db).unwrap();
            row_count(&conn, "teams").unwrap()
        }

        fn wipe(&self) {
            let conn = Connection::open(&self.db).unwrap();
            conn.execute("DELETE FROM teams", []).unwrap();
        }
    }

    #[test]
    fn test_backup_and_restore() {
        let ctx = TestContext::new();
        let manager = ctx.manager(false);

        let handle = manager.create_backup(&ctx.db).unwrap();
        assert!(handle.path.exists());
        assert!(handle.manifest_path().exists());
        assert_eq!(handle.baseline.rows("teams"), Some(2));
        assert_eq!(handle.checksum.len(), 64);

        ctx.wipe();
        assert_eq!(ctx.teams(), 0);

        manager.restore(&handle).unwrap();
        assert_eq!(ctx.teams(), 2);
        assert!(!with_suffix(&ctx.db, RESTORE_SUFFIX).exists());
    }

    #[test]
    fn test_compressed_backup_round_trip() {
        let ctx = TestContext::new();
        let manager = ctx.manager(true);

        let handle = manager.create_backup(&ctx.db).unwrap();
        assert!(handle.compressed);
        assert!(handle.path.to_string_lossy().ends_with(".db.gz"));
        manager.verify(&handle).unwrap();

        ctx.wipe();
        manager.restore(&handle).unwrap();
        assert_eq!(ctx.teams(), 2);
    }

    #[test]
    fn test_missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let manager = BackupManager::new(BackupConfig::new(dir.path().join("backups")));
        let err = manager.create_backup(&dir.path().join("absent.db")).unwrap_err();
        assert!(matches!(err, BackupError::SourceMissing(_)));
        assert!(!dir.path().join("absent.db").exists());
    }

    #[test]
    fn test_locked_source_is_reported() {
        let ctx = TestContext::new();
        let holder = Connection::open(&ctx.db).unwrap();
        holder.execute_batch("BEGIN EXCLUSIVE").unwrap();

        let manager = BackupManager::new(
            BackupConfig::for_database(&ctx.db).with_busy_timeout(Duration::from_millis(0)),
        );
        let err = manager.create_backup(&ctx.db).unwrap_err();
        assert!(matches!(err, BackupError::SourceLocked { .. }), "{err}");

        holder.execute_batch("ROLLBACK").unwrap();
    }

    #[test]
    fn test_tampered_snapshot_is_rejected() {
        let ctx = TestContext::new();
        let manager = ctx.manager(false);
        let handle = manager.create_backup(&ctx.db).unwrap();

        let mut bytes = fs::read(&handle.path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&handle.path, bytes).unwrap();

        ctx.wipe();
        let err = manager.restore(&handle).unwrap_err();
        assert!(matches!(err, BackupError::ChecksumMismatch { .. }));
        // Live database untouched, no temp file left behind.
        assert_eq!(ctx.teams(), 0);
        assert!(!with_suffix(&ctx.db, RESTORE_SUFFIX).exists());
    }

    #[test]
    fn test_restore_removes_sidecars() {
        let ctx = TestContext::new();
        let manager = ctx.manager(false);
        let handle = manager.create_backup(&ctx.db).unwrap();

        let sidecars: Vec<PathBuf> = ["-wal", "-journal"]
            .iter()
            .map(|suffix| with_suffix(&ctx.db, suffix))
            .collect();
        for sidecar in &sidecars {
            fs::write(sidecar, b"stale").unwrap();
        }
        manager.restore(&handle).unwrap();
        assert!(sidecars.iter().all(|sidecar| !sidecar.exists()));
        assert_eq!(ctx.teams(), 2);
    }

    #[test]
    fn test_list_orders_by_creation() {
        let ctx = TestContext::new();
        let manager = ctx.manager(false);
        assert!(manager.list().unwrap().is_empty());

        let first = manager.create_backup(&ctx.db).unwrap();
        let second = manager.create_backup(&ctx.db).unwrap();
        assert_ne!(first.id, second.id);

        let listed = manager.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1], second);
    }
}
