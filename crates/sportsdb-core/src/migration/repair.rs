//! Relationship repair: backfill missing membership rows.
//!
//! A membership row links a primary entity (team) to a parent (league,
//! division, conference) for a season, with an `is_active` flag. Entities
//! with no active membership for the season are found and linked either
//! through an explicit key column still present on the entity, or through
//! market-name hints matched against the entity's `name` / `market`.
//!
//! Every repair first re-checks for an existing active membership, so a
//! second run inserts nothing.

use super::error::MigrationError;
use crate::schema::{column_exists, quote_ident, table_exists};
use rusqlite::{params, Connection, ErrorCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Column holding the season scope on membership tables.
pub const SEASON_COLUMN: &str = "season";

/// Column holding the activity flag on membership tables.
pub const ACTIVE_COLUMN: &str = "is_active";

/// A join table linking entities to parents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipTable {
    /// Join table name.
    pub table: String,
    /// Column referencing the entity.
    pub entity_column: String,
    /// Column referencing the parent.
    pub parent_column: String,
}

impl MembershipTable {
    /// Describe a membership join table.
    pub fn new(
        table: impl Into<String>,
        entity_column: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            entity_column: entity_column.into(),
            parent_column: parent_column.into(),
        }
    }

    /// `NOT EXISTS` predicate selecting entities aliased `e` with no active
    /// membership in the season bound at `season_param`.
    fn missing_active_sql(&self, season_param: &str) -> String {
        format!(
            "NOT EXISTS (SELECT 1 FROM {m} m WHERE m.{ec} = e.\"id\" AND m.{active} = 1 AND m.{season} = {season_param})",
            m = quote_ident(&self.table),
            ec = quote_ident(&self.entity_column),
            active = quote_ident(ACTIVE_COLUMN),
            season = quote_ident(SEASON_COLUMN),
        )
    }
}

/// A "market name" pair naming the parent an entity belongs to,
/// e.g. `("Baltimore Ravens", "AFC")`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipHint {
    /// Market followed by nickname; the last token is the match key.
    pub market_name: String,
    /// Parent id, slug or name.
    pub parent: String,
}

impl MembershipHint {
    /// Create a hint.
    pub fn new(market_name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            market_name: market_name.into(),
            parent: parent.into(),
        }
    }

    /// The nickname, lower-cased.
    fn last_token(&self) -> Option<String> {
        words(&self.market_name).pop()
    }

    /// Every word before the nickname, lower-cased.
    fn market_prefix(&self) -> Vec<String> {
        let mut tokens = words(&self.market_name);
        tokens.pop();
        tokens
    }
}

/// Where the parent of a missing membership comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepairSource {
    /// A (deprecated) column on the entity table holding the parent id.
    Column {
        /// Column name on the entity table.
        column: String,
    },
    /// Market-name hints matched against the entity's name and market.
    Heuristic {
        /// Known market-name pairs.
        hints: Vec<MembershipHint>,
    },
}

/// A relationship repair to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSpec {
    /// Primary entity table (must have `id` and `name`).
    pub entity_table: String,
    /// Parent table (must have `id` and `name`).
    pub parent_table: String,
    /// Join table to backfill.
    pub membership: MembershipTable,
    /// Season the memberships are scoped to.
    pub season: i64,
    /// How parents are located.
    pub source: RepairSource,
}

/// A membership row inserted by a repair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairedRow {
    /// Entity id.
    pub entity_id: String,
    /// Parent id.
    pub parent_id: String,
    /// Season scope.
    pub season: i64,
    /// What produced the match (column name or hint).
    pub matched_by: String,
}

/// A row the repair could not fix. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairWarning {
    /// Entity id.
    pub entity_id: String,
    /// Why the row was skipped.
    pub reason: String,
}

impl std::fmt::Display for RepairWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "repair skipped for {}: {}", self.entity_id, self.reason)
    }
}

/// Result of a repair run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReport {
    /// Rows inserted.
    pub repaired: Vec<RepairedRow>,
    /// Rows skipped with a warning.
    pub skipped: Vec<RepairWarning>,
}

#[derive(Debug)]
struct EntityRow {
    id: String,
    name: String,
    market: Option<String>,
    sport_id: Option<String>,
}

impl EntityRow {
    /// Market words followed by name words.
    fn words(&self) -> Vec<String> {
        let mut all = words(self.market.as_deref().unwrap_or_default());
        all.extend(words(&self.name));
        all
    }
}

#[derive(Debug)]
struct ParentRow {
    id: String,
    sport_id: Option<String>,
}

/// Count entities with no active membership for the season (any season
/// when `season` is None).
pub fn count_orphans(
    conn: &Connection,
    entity_table: &str,
    membership: &MembershipTable,
    season: Option<i64>,
) -> rusqlite::Result<i64> {
    let season_filter = match season {
        Some(_) => format!(" AND m.{} = ?1", quote_ident(SEASON_COLUMN)),
        None => String::new(),
    };
    let sql = format!(
        "SELECT COUNT(*) FROM {e} e WHERE NOT EXISTS (\
         SELECT 1 FROM {m} m WHERE m.{ec} = e.\"id\" AND m.{active} = 1{season_filter})",
        e = quote_ident(entity_table),
        m = quote_ident(&membership.table),
        ec = quote_ident(&membership.entity_column),
        active = quote_ident(ACTIVE_COLUMN),
    );
    match season {
        Some(season) => conn.query_row(&sql, params![season], |row| row.get(0)),
        None => conn.query_row(&sql, [], |row| row.get(0)),
    }
}

/// Run a relationship repair on behalf of `step`.
pub fn repair_memberships(
    conn: &Connection,
    step: &str,
    spec: &RepairSpec,
) -> Result<RepairReport, MigrationError> {
    for table in [&spec.entity_table, &spec.parent_table, &spec.membership.table] {
        if !table_exists(conn, table)? {
            return Err(MigrationError::MutationFailure {
                step: step.to_string(),
                message: format!("repair requires table {table}"),
            });
        }
    }

    let report = match &spec.source {
        RepairSource::Column { column } => repair_from_column(conn, spec, column)?,
        RepairSource::Heuristic { hints } => repair_from_hints(conn, spec, hints)?,
    };

    info!(
        step,
        entity = %spec.entity_table,
        membership = %spec.membership.table,
        season = spec.season,
        repaired = report.repaired.len(),
        skipped = report.skipped.len(),
        "membership repair finished"
    );
    Ok(report)
}

fn repair_from_column(
    conn: &Connection,
    spec: &RepairSpec,
    column: &str,
) -> Result<RepairReport, MigrationError> {
    let mut report = RepairReport::default();
    if !column_exists(conn, &spec.entity_table, column)? {
        warn!(table = %spec.entity_table, column, "key column absent, nothing to backfill");
        return Ok(report);
    }

    let sql = format!(
        "SELECT e.\"id\", e.{col} FROM {e} e WHERE e.{col} IS NOT NULL AND {missing} ORDER BY e.\"id\"",
        col = quote_ident(column),
        e = quote_ident(&spec.entity_table),
        missing = spec.membership.missing_active_sql("?1"),
    );
    let mut stmt = conn.prepare(&sql)?;
    let candidates: Vec<(String, String)> = stmt
        .query_map(params![spec.season], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<_>>()?;

    let parent_sql = format!(
        "SELECT 1 FROM {} WHERE \"id\" = ?1",
        quote_ident(&spec.parent_table)
    );
    for (entity_id, parent_id) in candidates {
        let exists = conn
            .prepare_cached(&parent_sql)?
            .exists(params![parent_id])?;
        if !exists {
            skip(&mut report, &entity_id, format!("{column} references missing parent {parent_id}"));
            continue;
        }
        insert_membership(conn, spec, &entity_id, &parent_id, column, &mut report)?;
    }

    Ok(report)
}

fn repair_from_hints(
    conn: &Connection,
    spec: &RepairSpec,
    hints: &[MembershipHint],
) -> Result<RepairReport, MigrationError> {
    let mut report = RepairReport::default();
    let tokens: Vec<Option<String>> = hints.iter().map(MembershipHint::last_token).collect();

    for entity in &load_orphans(conn, spec)? {
        let entity_words = entity.words();
        // indices into `hints` whose nickname is a whole word of the entity
        let candidates: Vec<usize> = tokens
            .iter()
            .enumerate()
            .filter(|(_, token)| token.as_ref().is_some_and(|t| entity_words.contains(t)))
            .map(|(index, _)| index)
            .collect();
        if candidates.is_empty() {
            skip(&mut report, &entity.id, format!("no parent match for {:?}", entity.name));
            continue;
        }
        let candidates = narrow_by_market(&entity_words, &candidates, hints);

        let mut parents = BTreeSet::new();
        let mut matched_by = Vec::new();
        for index in candidates {
            let hint = &hints[index];
            for parent in resolve_parents(conn, spec, &hint.parent)? {
                let compatible = match (&entity.sport_id, &parent.sport_id) {
                    (Some(entity_sport), Some(parent_sport)) => entity_sport == parent_sport,
                    _ => true,
                };
                if compatible && parents.insert(parent.id) {
                    matched_by.push(hint.market_name.clone());
                }
            }
        }

        match parents.len() {
            0 => skip(
                &mut report,
                &entity.id,
                format!("no parent of a compatible sport for {:?}", entity.name),
            ),
            1 => {
                let parent_id = parents.into_iter().next().unwrap_or_default();
                let hint = matched_by.join(", ");
                insert_membership(conn, spec, &entity.id, &parent_id, &hint, &mut report)?;
            }
            _ => skip(
                &mut report,
                &entity.id,
                format!(
                    "ambiguous parents {:?} for {:?}",
                    parents.into_iter().collect::<Vec<_>>(),
                    entity.name
                ),
            ),
        }
    }

    Ok(report)
}

fn load_orphans(conn: &Connection, spec: &RepairSpec) -> Result<Vec<EntityRow>, MigrationError> {
    let market = if column_exists(conn, &spec.entity_table, "market")? {
        "e.\"market\""
    } else {
        "NULL"
    };
    let sport = if column_exists(conn, &spec.entity_table, "sport_id")? {
        "e.\"sport_id\""
    } else {
        "NULL"
    };
    let sql = format!(
        "SELECT e.\"id\", e.\"name\", {market}, {sport} FROM {e} e WHERE {missing} ORDER BY e.\"id\"",
        e = quote_ident(&spec.entity_table),
        missing = spec.membership.missing_active_sql("?1"),
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params![spec.season], |row| {
        Ok(EntityRow {
            id: row.get(0)?,
            name: row.get(1)?,
            market: row.get(2)?,
            sport_id: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

/// Prefer hints whose market words also appear, in order, on the entity.
fn narrow_by_market(entity_words: &[String], candidates: &[usize], hints: &[MembershipHint]) -> Vec<usize> {
    if candidates.len() < 2 {
        return candidates.to_vec();
    }
    let narrowed: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&i| {
            let prefix = hints[i].market_prefix();
            !prefix.is_empty()
                && entity_words
                    .windows(prefix.len())
                    .any(|window| window == prefix.as_slice())
        })
        .collect();
    if narrowed.is_empty() {
        candidates.to_vec()
    } else {
        narrowed
    }
}

fn resolve_parents(
    conn: &Connection,
    spec: &RepairSpec,
    parent: &str,
) -> Result<Vec<ParentRow>, MigrationError> {
    let sport = if column_exists(conn, &spec.parent_table, "sport_id")? {
        "p.\"sport_id\""
    } else {
        "NULL"
    };
    let slug = if column_exists(conn, &spec.parent_table, "slug")? {
        " OR p.\"slug\" = ?1"
    } else {
        ""
    };
    let sql = format!(
        "SELECT p.\"id\", {sport} FROM {p} p WHERE p.\"id\" = ?1 OR p.\"name\" = ?1 COLLATE NOCASE{slug}",
        p = quote_ident(&spec.parent_table),
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![parent], |row| {
        Ok(ParentRow {
            id: row.get(0)?,
            sport_id: row.get(1)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn insert_membership(
    conn: &Connection,
    spec: &RepairSpec,
    entity_id: &str,
    parent_id: &str,
    matched_by: &str,
    report: &mut RepairReport,
) -> Result<(), MigrationError> {
    let m = &spec.membership;
    let sql = format!(
        "INSERT INTO {m} ({ec}, {pc}, {season}, {active}) \
         SELECT ?1, ?2, ?3, 1 WHERE NOT EXISTS (\
         SELECT 1 FROM {m} WHERE {ec} = ?1 AND {active} = 1 AND {season} = ?3) \
         ON CONFLICT DO NOTHING",
        m = quote_ident(&m.table),
        ec = quote_ident(&m.entity_column),
        pc = quote_ident(&m.parent_column),
        season = quote_ident(SEASON_COLUMN),
        active = quote_ident(ACTIVE_COLUMN),
    );

    match conn.execute(&sql, params![entity_id, parent_id, spec.season]) {
        Ok(0) => skip(
            report,
            entity_id,
            format!("membership to {parent_id} already exists for season {}", spec.season),
        ),
        Ok(_) => {
            info!(
                entity = entity_id,
                parent = parent_id,
                season = spec.season,
                matched_by,
                "repaired membership"
            );
            report.repaired.push(RepairedRow {
                entity_id: entity_id.to_string(),
                parent_id: parent_id.to_string(),
                season: spec.season,
                matched_by: matched_by.to_string(),
            });
        }
        Err(e) if is_constraint_violation(&e) => {
            skip(report, entity_id, format!("constraint violation: {e}"));
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn skip(report: &mut RepairReport, entity_id: &str, reason: String) {
    let warning = RepairWarning {
        entity_id: entity_id.to_string(),
        reason,
    };
    warn!("{}", warning);
    report.skipped.push(warning);
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Lower-cased alphanumeric words of `text`.
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .map(str::to_lowercase)
        .collect()
}
