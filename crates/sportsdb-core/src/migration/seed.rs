//! Reference-data seeding.
//!
//! Seed rows are inserted with `ON CONFLICT DO NOTHING` against the table's
//! natural-key unique constraint, so re-running a seed set is a no-op.
//! Seed tables are keyed by `id`; the keys of rows actually inserted are
//! reported so a revert can remove exactly those.

use crate::schema::quote_ident;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Derive a URL-safe slug from a display name.
///
/// Lower-cases, drops everything outside `[a-z0-9]`, whitespace and `-`,
/// collapses whitespace/hyphen runs into one `-`, and trims hyphens at both
/// ends. `"St. Louis Blues"` becomes `"st-louis-blues"`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_separator = false;

    for ch in name.chars().flat_map(char::to_lowercase) {
        match ch {
            'a'..='z' | '0'..='9' => {
                if pending_separator && !slug.is_empty() {
                    slug.push('-');
                }
                pending_separator = false;
                slug.push(ch);
            }
            c if c == '-' || c.is_whitespace() => pending_separator = true,
            _ => {}
        }
    }

    slug
}

/// A value in a seed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SeedValue {
    /// SQL NULL.
    Null,
    /// Integer value.
    Integer(i64),
    /// Text value.
    Text(String),
    /// Boolean stored as 0/1.
    Bool(bool),
    /// The `id` of the row in `table` whose `slug` matches.
    SlugRef {
        /// Referenced table.
        table: String,
        /// Slug of the referenced row.
        slug: String,
    },
}

impl SeedValue {
    /// Reference another seeded row by slug.
    pub fn slug_ref(table: impl Into<String>, slug: impl Into<String>) -> Self {
        SeedValue::SlugRef {
            table: table.into(),
            slug: slug.into(),
        }
    }

    fn as_text(&self) -> Option<&str> {
        match self {
            SeedValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Placeholder expression and bound value for this seed value.
    fn bind(&self, position: usize) -> (String, Value) {
        match self {
            SeedValue::Null => (format!("?{position}"), Value::Null),
            SeedValue::Integer(v) => (format!("?{position}"), Value::Integer(*v)),
            SeedValue::Text(v) => (format!("?{position}"), Value::Text(v.clone())),
            SeedValue::Bool(v) => (format!("?{position}"), Value::Integer(i64::from(*v))),
            SeedValue::SlugRef { table, slug } => (
                format!("(SELECT \"id\" FROM {} WHERE \"slug\" = ?{position})", quote_ident(table)),
                Value::Text(slug.clone()),
            ),
        }
    }
}

impl From<&str> for SeedValue {
    fn from(value: &str) -> Self {
        SeedValue::Text(value.to_string())
    }
}

impl From<String> for SeedValue {
    fn from(value: String) -> Self {
        SeedValue::Text(value)
    }
}

impl From<i64> for SeedValue {
    fn from(value: i64) -> Self {
        SeedValue::Integer(value)
    }
}

impl From<bool> for SeedValue {
    fn from(value: bool) -> Self {
        SeedValue::Bool(value)
    }
}

/// One seed row: ordered `(column, value)` pairs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeedRow {
    /// Column values in insertion order.
    pub values: Vec<(String, SeedValue)>,
}

impl SeedRow {
    /// Create an empty row.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a column value.
    pub fn set(mut self, column: impl Into<String>, value: impl Into<SeedValue>) -> Self {
        self.values.push((column.into(), value.into()));
        self
    }

    fn get(&self, column: &str) -> Option<&SeedValue> {
        self.values
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }
}

/// A batch of reference rows for one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedSet {
    /// Target table.
    pub table: String,
    /// Column whose text is slugified into `slug`; the slug also becomes the
    /// `id` when the row sets none.
    pub slug_source: Option<String>,
    /// Rows to insert.
    pub rows: Vec<SeedRow>,
}

impl SeedSet {
    /// Create a seed set for a table without slug derivation.
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            slug_source: None,
            rows: Vec::new(),
        }
    }

    /// Derive `slug` (and a default `id`) from the given column.
    pub fn slugged_from(mut self, column: impl Into<String>) -> Self {
        self.slug_source = Some(column.into());
        self
    }

    /// Add a row.
    pub fn row(mut self, row: SeedRow) -> Self {
        self.rows.push(row);
        self
    }

    fn complete_row(&self, row: &SeedRow) -> Result<SeedRow, String> {
        let mut row = row.clone();
        if let Some(source) = &self.slug_source {
            let name = row
                .get(source)
                .and_then(SeedValue::as_text)
                .ok_or_else(|| format!("seed row for {} has no text {}", self.table, source))?;
            let slug = slugify(name);
            if slug.is_empty() {
                return Err(format!("seed value {name:?} produces an empty slug"));
            }
            if row.get("slug").is_none() {
                row.values.push(("slug".to_string(), SeedValue::Text(slug.clone())));
            }
            if row.get("id").is_none() {
                row.values.push(("id".to_string(), SeedValue::Text(slug)));
            }
        }
        Ok(row)
    }
}

/// Outcome of inserting a seed set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedOutcome {
    /// Rows newly inserted.
    pub inserted: usize,
    /// Rows skipped because their natural key already existed.
    pub skipped: usize,
    /// `id` of every inserted row, in insertion order.
    pub keys: Vec<String>,
}

/// Insert every row of a seed set, skipping rows whose unique key exists.
pub fn insert_seed_set(conn: &Connection, set: &SeedSet) -> Result<SeedOutcome, SeedError> {
    let mut outcome = SeedOutcome::default();

    for row in &set.rows {
        let row = set.complete_row(row).map_err(SeedError::InvalidRow)?;
        let columns: Vec<String> = row.values.iter().map(|(c, _)| quote_ident(c)).collect();
        let (placeholders, values): (Vec<String>, Vec<Value>) = row
            .values
            .iter()
            .enumerate()
            .map(|(i, (_, value))| value.bind(i + 1))
            .unzip();

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING RETURNING CAST(\"id\" AS TEXT)",
            quote_ident(&set.table),
            columns.join(", "),
            placeholders.join(", ")
        );

        let key: Option<String> = conn
            .query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))
            .optional()?;
        match key {
            Some(key) => {
                outcome.inserted += 1;
                outcome.keys.push(key);
            }
            None => outcome.skipped += 1,
        }
    }

    debug!(
        table = %set.table,
        inserted = outcome.inserted,
        skipped = outcome.skipped,
        "seed set applied"
    );
    Ok(outcome)
}

/// Errors raised while seeding.
#[derive(Debug, thiserror::Error)]
pub enum SeedError {
    /// The row could not be completed (missing slug source, empty slug).
    #[error("invalid seed row: {0}")]
    InvalidRow(String),
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Football"), "football");
        assert_eq!(slugify("St. Louis Blues"), "st-louis-blues");
        assert_eq!(slugify("  Texas A&M -- Aggies "), "texas-am-aggies");
        assert_eq!(slugify("Ligue 1"), "ligue-1");
        assert_eq!(slugify("---"), "");
    }

    #[test]
    fn test_slugify_is_stable() {
        let name = "Los Angeles  Kings";
        assert_eq!(slugify(name), slugify(name));
        assert_eq!(slugify(name), "los-angeles-kings");
    }

    fn sports_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE sports (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE
            );
            CREATE TABLE leagues (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                sport_id TEXT NOT NULL REFERENCES sports(id)
            );
            "#,
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_duplicate_seed_rows_are_skipped() {
        let conn = sports_conn();
        let set = SeedSet::new("sports")
            .slugged_from("name")
            .row(SeedRow::new().set("name", "Football"))
            .row(SeedRow::new().set("name", "Football"));

        let first = insert_seed_set(&conn, &set).unwrap();
        assert_eq!((first.inserted, first.skipped), (1, 1));
        assert_eq!(first.keys, vec!["football"]);

        let second = insert_seed_set(&conn, &set).unwrap();
        assert_eq!((second.inserted, second.skipped), (0, 2));
        assert!(second.keys.is_empty());

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM sports WHERE name = 'Football'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_slug_ref_resolves_parent() {
        let conn = sports_conn();
        insert_seed_set(
            &conn,
            &SeedSet::new("sports")
                .slugged_from("name")
                .row(SeedRow::new().set("name", "Basketball")),
        )
        .unwrap();
        insert_seed_set(
            &conn,
            &SeedSet::new("leagues").slugged_from("name").row(
                SeedRow::new()
                    .set("name", "NBA")
                    .set("sport_id", SeedValue::slug_ref("sports", "basketball")),
            ),
        )
        .unwrap();

        let sport: String = conn
            .query_row("SELECT sport_id FROM leagues WHERE slug = 'nba'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(sport, "basketball");
    }

    #[test]
    fn test_missing_slug_source_is_rejected() {
        let conn = sports_conn();
        let set = SeedSet::new("sports")
            .slugged_from("name")
            .row(SeedRow::new().set("id", "x"));
        assert!(matches!(
            insert_seed_set(&conn, &set),
            Err(SeedError::InvalidRow(_))
        ));
    }

    #[test]
    fn test_keys_report_only_inserted_rows() {
        let conn = sports_conn();
        conn.execute(
            "INSERT INTO sports (id, name, slug) VALUES ('football', 'Football', 'football')",
            [],
        )
        .unwrap();
        let set = SeedSet::new("sports")
            .slugged_from("name")
            .row(SeedRow::new().set("name", "Football"))
            .row(SeedRow::new().set("name", "Ice Hockey"));

        let outcome = insert_seed_set(&conn, &set).unwrap();
        assert_eq!(outcome.keys, vec!["ice-hockey"]);
        assert_eq!(outcome.skipped, 1);
    }
}
