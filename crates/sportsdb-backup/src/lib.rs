//! Snapshot and restore for sportsdb databases.
//!
//! Every migration step runs against a fresh snapshot. A snapshot is a copy
//! of the database file (optionally gzip compressed) plus a JSON manifest
//! holding its SHA-256 checksum and the counters captured at backup time.
//! Restores expand into a temporary file, verify the checksum, and rename
//! over the live database.
//!
//! # Example
//!
//! ```ignore
//! use sportsdb_backup::{BackupConfig, BackupManager};
//!
//! let manager = BackupManager::new(BackupConfig::for_database(&db_path));
//! let handle = manager.create_backup(&db_path)?;
//! // ... migration fails ...
//! manager.restore(&handle)?;
//! ```

pub mod error;
pub mod handle;
pub mod manager;

pub use error::{BackupError, Result};
pub use handle::{backup_name, BackupHandle};
pub use manager::{BackupConfig, BackupManager, DEFAULT_BACKUP_DIR, RESTORE_SUFFIX};
