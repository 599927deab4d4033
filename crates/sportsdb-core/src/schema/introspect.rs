//! Read-only schema introspection over `sqlite_master` and the table-valued
//! pragma functions.

use super::ddl::quote_ident;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// A column as reported by `pragma_table_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub decl_type: String,
    /// Whether the column is `NOT NULL`.
    pub not_null: bool,
    /// Position within the primary key (0 when not part of it).
    pub pk: i64,
}

/// A stored schema object (index, trigger or view) and its SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object name.
    pub name: String,
    /// Owning table.
    pub table: String,
    /// The `CREATE ...` statement.
    pub sql: String,
}

/// A row reported by `PRAGMA foreign_key_check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKeyViolation {
    /// Child table holding the dangling reference.
    pub table: String,
    /// Rowid of the offending row (None for WITHOUT ROWID tables).
    pub rowid: Option<i64>,
    /// Referenced parent table.
    pub parent: String,
}

/// A `sqlite_master` entry, used to compare whole-schema snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterEntry {
    /// Object type (`table`, `index`, `trigger`, `view`).
    pub kind: String,
    /// Object name.
    pub name: String,
    /// Creation SQL, absent for automatic indexes.
    pub sql: Option<String>,
}

/// Whether a user table exists.
pub fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Whether a column exists on a table. Returns false for missing tables.
pub fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2 COLLATE NOCASE",
        params![table, column],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Columns of a table in declaration order.
pub fn columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<ColumnInfo>> {
    let mut stmt = conn.prepare(
        "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
    )?;
    let rows = stmt.query_map(params![table], |row| {
        Ok(ColumnInfo {
            name: row.get(0)?,
            decl_type: row.get(1)?,
            not_null: row.get::<_, i64>(2)? != 0,
            pk: row.get(3)?,
        })
    })?;
    rows.collect()
}

/// All user tables, sorted by name. Internal `sqlite_*` tables are excluded.
pub fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    rows.collect()
}

fn stored_objects(
    conn: &Connection,
    kind: &str,
    table: Option<&str>,
) -> rusqlite::Result<Vec<StoredObject>> {
    let mut stmt = conn.prepare(
        "SELECT name, tbl_name, sql FROM sqlite_master \
         WHERE type = ?1 AND sql IS NOT NULL AND (?2 IS NULL OR tbl_name = ?2) \
         ORDER BY name",
    )?;
    let rows = stmt.query_map(params![kind, table], |row| {
        Ok(StoredObject {
            name: row.get(0)?,
            table: row.get(1)?,
            sql: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Explicitly created indexes on a table (automatic indexes are skipped).
pub fn list_indexes(conn: &Connection, table: &str) -> rusqlite::Result<Vec<StoredObject>> {
    stored_objects(conn, "index", Some(table))
}

/// Triggers attached to a table.
pub fn list_triggers(conn: &Connection, table: &str) -> rusqlite::Result<Vec<StoredObject>> {
    stored_objects(conn, "trigger", Some(table))
}

/// All views in the database.
pub fn list_views(conn: &Connection) -> rusqlite::Result<Vec<StoredObject>> {
    stored_objects(conn, "view", None)
}

/// Every explicit index, trigger and view. A view owns itself.
pub fn list_schema_objects(conn: &Connection) -> rusqlite::Result<Vec<StoredObject>> {
    let mut stmt = conn.prepare(
        "SELECT name, tbl_name, sql FROM sqlite_master \
         WHERE type IN ('index', 'trigger', 'view') AND sql IS NOT NULL \
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(StoredObject {
            name: row.get(0)?,
            table: row.get(1)?,
            sql: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Whether a named index exists.
pub fn index_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Whether a named trigger exists.
pub fn trigger_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'trigger' AND name = ?1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Whether a named view exists.
pub fn view_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'view' AND name = ?1",
        params![name],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

/// Columns covered by an index. Expression entries are skipped.
pub fn index_columns(conn: &Connection, index: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let rows = stmt.query_map(params![index], |row| row.get::<_, Option<String>>(0))?;
    let names: Vec<Option<String>> = rows.collect::<rusqlite::Result<_>>()?;
    Ok(names.into_iter().flatten().collect())
}

/// Tables declaring a foreign key that references `parent`.
pub fn dependent_tables(conn: &Connection, parent: &str) -> rusqlite::Result<Vec<String>> {
    let mut dependents = Vec::new();
    for table in list_tables(conn)? {
        if table.eq_ignore_ascii_case(parent) {
            continue;
        }
        let referenced: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM pragma_foreign_key_list(?1) WHERE \"table\" = ?2 COLLATE NOCASE",
                params![table, parent],
                |row| row.get(0),
            )
            .optional()?;
        if referenced.is_some() {
            dependents.push(table);
        }
    }
    Ok(dependents)
}

/// Exact row count for a table.
pub fn row_count(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )
}

/// Run a full foreign-key integrity scan.
pub fn foreign_key_violations(conn: &Connection) -> rusqlite::Result<Vec<ForeignKeyViolation>> {
    let mut stmt = conn.prepare("PRAGMA foreign_key_check")?;
    let rows = stmt.query_map([], |row| {
        Ok(ForeignKeyViolation {
            table: row.get(0)?,
            rowid: row.get(1)?,
            parent: row.get(2)?,
        })
    })?;
    rows.collect()
}

/// Whether foreign-key enforcement is currently on for this connection.
pub fn foreign_keys_enabled(conn: &Connection) -> rusqlite::Result<bool> {
    conn.pragma_query_value(None, "foreign_keys", |row| row.get::<_, i64>(0))
        .map(|v| v != 0)
}

/// Switch foreign-key enforcement. Has no effect inside an open transaction.
pub fn set_foreign_keys(conn: &Connection, enabled: bool) -> rusqlite::Result<()> {
    conn.pragma_update(None, "foreign_keys", enabled)
}

/// Every schema object in `sqlite_master`, ordered for comparison.
pub fn master_entries(conn: &Connection) -> rusqlite::Result<Vec<MasterEntry>> {
    let mut stmt =
        conn.prepare("SELECT type, name, sql FROM sqlite_master ORDER BY type, name")?;
    let rows = stmt.query_map([], |row| {
        Ok(MasterEntry {
            kind: row.get(0)?,
            name: row.get(1)?,
            sql: row.get(2)?,
        })
    })?;
    rows.collect()
}
