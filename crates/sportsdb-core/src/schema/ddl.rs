//! DDL builders for tables, indexes and triggers.
//!
//! Definitions are plain data so migration steps can be hashed, compared and
//! rendered into statements with consistently quoted identifiers.

use serde::{Deserialize, Serialize};

/// Quote an identifier for use in SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// A single column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Declared SQL type (`TEXT`, `INTEGER`, ...).
    pub sql_type: String,
    /// Trailing column constraints (`NOT NULL`, `DEFAULT 0`, `REFERENCES ...`).
    pub constraints: String,
}

impl ColumnDef {
    /// Create a column with no constraints.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            constraints: String::new(),
        }
    }

    /// Append a column constraint.
    pub fn with(mut self, constraint: impl AsRef<str>) -> Self {
        if !self.constraints.is_empty() {
            self.constraints.push(' ');
        }
        self.constraints.push_str(constraint.as_ref());
        self
    }

    /// Shorthand for a `TEXT PRIMARY KEY` column.
    pub fn text_key(name: impl Into<String>) -> Self {
        Self::new(name, "TEXT").with("PRIMARY KEY NOT NULL")
    }

    /// Render the column as it appears inside `CREATE TABLE`.
    pub fn to_sql(&self) -> String {
        let mut sql = format!("{} {}", quote_ident(&self.name), self.sql_type);
        if !self.constraints.is_empty() {
            sql.push(' ');
            sql.push_str(&self.constraints);
        }
        sql
    }
}

/// A complete table definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Ordered column definitions.
    pub columns: Vec<ColumnDef>,
    /// Table constraints (`UNIQUE (...)`, `FOREIGN KEY ...`, `CHECK (...)`).
    pub constraints: Vec<String>,
}

impl TableDef {
    /// Create an empty table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
        }
    }

    /// Add a column.
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a table constraint.
    pub fn constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraints.push(constraint.into());
        self
    }

    /// Add `created_at` and `updated_at` timestamp columns.
    pub fn timestamps(self) -> Self {
        self.column(
            ColumnDef::new("created_at", "TEXT").with("NOT NULL DEFAULT CURRENT_TIMESTAMP"),
        )
        .column(ColumnDef::new("updated_at", "TEXT").with("NOT NULL DEFAULT CURRENT_TIMESTAMP"))
    }

    /// Column names in declaration order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Whether the definition declares the named column.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Render `CREATE TABLE IF NOT EXISTS` for this definition.
    pub fn create_sql(&self) -> String {
        self.create_sql_named(&self.name, true)
    }

    /// Render the definition under a different table name.
    pub fn create_sql_named(&self, name: &str, if_not_exists: bool) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(ColumnDef::to_sql).collect();
        parts.extend(self.constraints.iter().cloned());
        format!(
            "CREATE TABLE {}{} (\n    {}\n)",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            quote_ident(name),
            parts.join(",\n    ")
        )
    }
}

/// An index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Indexed table.
    pub table: String,
    /// Indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

impl IndexDef {
    /// Create a non-unique index named `idx_<table>_<col>[_<col>...]`.
    pub fn on(table: impl Into<String>, columns: &[&str]) -> Self {
        let table = table.into();
        let name = format!("idx_{}_{}", table, columns.join("_"));
        Self {
            name,
            table,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    /// Make the index unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Render `CREATE INDEX IF NOT EXISTS`.
    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            quote_ident(&self.name),
            quote_ident(&self.table),
            columns.join(", ")
        )
    }
}

/// Name of the trigger that keeps `updated_at` current on a table.
pub fn touch_trigger_name(table: &str) -> String {
    format!("trg_{}_touch_updated_at", table)
}

/// Render the "touch updated_at" trigger for a table.
///
/// The `WHEN` clause stops the trigger from re-firing on its own update.
pub fn touch_trigger_sql(table: &str) -> String {
    let table_ident = quote_ident(table);
    format!(
        "CREATE TRIGGER IF NOT EXISTS {name}\n\
         AFTER UPDATE ON {table} FOR EACH ROW\n\
         WHEN NEW.\"updated_at\" = OLD.\"updated_at\"\n\
         BEGIN\n    \
             UPDATE {table} SET \"updated_at\" = CURRENT_TIMESTAMP WHERE rowid = NEW.rowid;\n\
         END",
        name = quote_ident(&touch_trigger_name(table)),
        table = table_ident,
    )
}

/// Whether `sql` refers to `ident` as a whole identifier (case-insensitive).
pub fn mentions_identifier(sql: &str, ident: &str) -> bool {
    let ident = ident.to_ascii_lowercase();
    sql.to_ascii_lowercase()
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .any(|token| token == ident)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("teams"), "\"teams\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_table_create_sql() {
        let table = TableDef::new("sports")
            .column(ColumnDef::text_key("id"))
            .column(ColumnDef::new("name", "TEXT").with("NOT NULL"))
            .constraint("UNIQUE (\"slug\")");

        let sql = table.create_sql();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"sports\""));
        assert!(sql.contains("\"name\" TEXT NOT NULL"));
        assert!(sql.contains("UNIQUE (\"slug\")"));

        let renamed = table.create_sql_named("sports__rebuild", false);
        assert!(renamed.starts_with("CREATE TABLE \"sports__rebuild\""));
    }

    #[test]
    fn test_index_naming() {
        let idx = IndexDef::on("games", &["home_team_id", "season"]).unique();
        assert_eq!(idx.name, "idx_games_home_team_id_season");
        assert!(idx.create_sql().starts_with("CREATE UNIQUE INDEX IF NOT EXISTS"));
    }

    #[test]
    fn test_mentions_identifier() {
        assert!(mentions_identifier("SELECT * FROM teams t", "teams"));
        assert!(mentions_identifier("select league_id from \"TEAMS\"", "league_id"));
        assert!(!mentions_identifier("SELECT * FROM teams_archive", "teams"));
    }

    #[test]
    fn test_touch_trigger_mentions_table() {
        let sql = touch_trigger_sql("teams");
        assert!(sql.contains("\"trg_teams_touch_updated_at\""));
        assert!(mentions_identifier(&sql, "teams"));
    }
}
