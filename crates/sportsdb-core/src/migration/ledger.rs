//! The applied-steps ledger.
//!
//! A table recording which steps have been applied, when, and with which
//! checksum. It is written inside the same transaction as the step's
//! operations, so a restored snapshot also restores the ledger.
//!
//! Each row also keeps the keys of the seed rows the step inserted, as a
//! JSON object of table name to `id` list, so reverting removes only rows
//! the step created.

use super::error::MigrationError;
use super::step::MigrationStep;
use crate::schema::{column_exists, table_exists};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the ledger table.
pub const LEDGER_TABLE: &str = "schema_migrations";

/// A ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Step id.
    pub id: String,
    /// Predecessor at the time of application.
    pub predecessor: Option<String>,
    /// Step checksum at the time of application.
    pub checksum: String,
    /// When the step committed.
    pub applied_at: DateTime<Utc>,
}

/// Seed keys per table.
pub type SeededRows = BTreeMap<String, Vec<String>>;

/// Create the ledger table if it is missing, and add the `seeded_rows`
/// column to ledgers written before it existed.
pub fn ensure(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS \"schema_migrations\" (
            \"id\" TEXT PRIMARY KEY NOT NULL,
            \"predecessor\" TEXT,
            \"checksum\" TEXT NOT NULL,
            \"applied_at\" TEXT NOT NULL,
            \"seeded_rows\" TEXT
        )",
    )?;
    if !column_exists(conn, LEDGER_TABLE, "seeded_rows")? {
        conn.execute_batch("ALTER TABLE \"schema_migrations\" ADD COLUMN \"seeded_rows\" TEXT")?;
    }
    Ok(())
}

/// Applied steps in application order. An absent ledger means nothing has
/// been applied; the table is not created here so read-only callers leave
/// the schema untouched.
pub fn applied(conn: &Connection) -> Result<Vec<LedgerEntry>, MigrationError> {
    if !table_exists(conn, LEDGER_TABLE)? {
        return Ok(Vec::new());
    }

    let mut stmt = conn.prepare(
        "SELECT id, predecessor, checksum, applied_at FROM \"schema_migrations\" \
         ORDER BY applied_at, rowid",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, Option<String>>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
        ))
    })?;

    let mut entries = Vec::new();
    for row in rows {
        let (id, predecessor, checksum, applied_at) = row?;
        let applied_at = DateTime::parse_from_rfc3339(&applied_at)
            .map_err(|e| MigrationError::Serialization(format!("ledger row {id}: {e}")))?
            .with_timezone(&Utc);
        entries.push(LedgerEntry {
            id,
            predecessor,
            checksum,
            applied_at,
        });
    }
    Ok(entries)
}

/// Record a step as applied, with the seed keys it inserted.
pub fn record(
    conn: &Connection,
    step: &MigrationStep,
    seeded: &SeededRows,
) -> Result<(), MigrationError> {
    ensure(conn)?;
    let seeded = if seeded.is_empty() {
        None
    } else {
        Some(serde_json::to_string(seeded).map_err(|e| MigrationError::Serialization(e.to_string()))?)
    };
    conn.execute(
        "INSERT INTO \"schema_migrations\" (id, predecessor, checksum, applied_at, seeded_rows) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            step.id,
            step.predecessor,
            step.checksum(),
            Utc::now().to_rfc3339(),
            seeded
        ],
    )?;
    Ok(())
}

/// Seed keys recorded for an applied step. Empty when the step is not in
/// the ledger or seeded nothing.
pub fn seeded_rows(conn: &Connection, id: &str) -> Result<SeededRows, MigrationError> {
    if !table_exists(conn, LEDGER_TABLE)? || !column_exists(conn, LEDGER_TABLE, "seeded_rows")? {
        return Ok(SeededRows::new());
    }
    let stored: Option<Option<String>> = conn
        .query_row(
            "SELECT seeded_rows FROM \"schema_migrations\" WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    match stored.flatten() {
        Some(json) => serde_json::from_str(&json)
            .map_err(|e| MigrationError::Serialization(format!("ledger row {id}: {e}"))),
        None => Ok(SeededRows::new()),
    }
}

/// Remove a step's ledger row (used when reverting).
pub fn remove(conn: &Connection, id: &str) -> rusqlite::Result<usize> {
    if !table_exists(conn, LEDGER_TABLE)? {
        return Ok(0);
    }
    conn.execute("DELETE FROM \"schema_migrations\" WHERE id = ?1", params![id])
}
