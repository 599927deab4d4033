//! Table definitions for the sports platform schema.

use crate::schema::{ColumnDef, IndexDef, TableDef};

fn id() -> ColumnDef {
    ColumnDef::text_key("id")
}

fn serial() -> ColumnDef {
    ColumnDef::new("id", "INTEGER").with("PRIMARY KEY AUTOINCREMENT")
}

fn name() -> ColumnDef {
    ColumnDef::new("name", "TEXT").with("NOT NULL")
}

fn slug() -> ColumnDef {
    ColumnDef::new("slug", "TEXT").with("NOT NULL")
}

fn unique_slug() -> ColumnDef {
    ColumnDef::new("slug", "TEXT").with("NOT NULL UNIQUE")
}

fn fk(column: &str, parent: &str, on_delete: &str) -> ColumnDef {
    ColumnDef::new(column, "TEXT").with(format!("REFERENCES \"{parent}\"(\"id\") ON DELETE {on_delete}"))
}

fn required_fk(column: &str, parent: &str, on_delete: &str) -> ColumnDef {
    ColumnDef::new(column, "TEXT")
        .with("NOT NULL")
        .with(format!("REFERENCES \"{parent}\"(\"id\") ON DELETE {on_delete}"))
}

// ---- reference ----

pub fn sports() -> TableDef {
    TableDef::new("sports").column(id()).column(name()).column(unique_slug()).timestamps()
}

pub fn leagues() -> TableDef {
    TableDef::new("leagues")
        .column(id())
        .column(fk("sport_id", "sports", "RESTRICT"))
        .column(name())
        .column(ColumnDef::new("abbreviation", "TEXT"))
        .column(unique_slug())
        .timestamps()
}

pub fn conferences() -> TableDef {
    TableDef::new("conferences")
        .column(id())
        .column(required_fk("league_id", "leagues", "CASCADE"))
        .column(name())
        .column(slug())
        .timestamps()
        .constraint("UNIQUE (\"league_id\", \"slug\")")
}

pub fn divisions() -> TableDef {
    TableDef::new("divisions")
        .column(id())
        .column(required_fk("conference_id", "conferences", "CASCADE"))
        .column(name())
        .column(slug())
        .timestamps()
        .constraint("UNIQUE (\"conference_id\", \"slug\")")
}

/// The teams table. `league_id` is the deprecated single-league pointer
/// replaced by `team_league_memberships`.
pub fn teams(with_league_id: bool) -> TableDef {
    let mut def = TableDef::new("teams")
        .column(id())
        .column(fk("sport_id", "sports", "RESTRICT"));
    if with_league_id {
        def = def.column(fk("league_id", "leagues", "SET NULL"));
    }
    def.column(name())
        .column(ColumnDef::new("market", "TEXT"))
        .column(ColumnDef::new("abbreviation", "TEXT"))
        .column(slug())
        .timestamps()
        .constraint("UNIQUE (\"sport_id\", \"slug\")")
}

pub fn reference_indexes() -> Vec<IndexDef> {
    vec![
        IndexDef::on("leagues", &["sport_id"]),
        IndexDef::on("conferences", &["league_id"]),
        IndexDef::on("divisions", &["conference_id"]),
        IndexDef::on("teams", &["sport_id"]),
        IndexDef::on("teams", &["league_id"]),
        IndexDef::on("teams", &["name"]),
    ]
}

// ---- venues and content ----

pub fn venues() -> TableDef {
    TableDef::new("venues")
        .column(id())
        .column(name())
        .column(ColumnDef::new("city", "TEXT"))
        .column(ColumnDef::new("state", "TEXT"))
        .column(ColumnDef::new("country", "TEXT"))
        .column(ColumnDef::new("capacity", "INTEGER").with("CHECK (\"capacity\" IS NULL OR \"capacity\" >= 0)"))
        .column(unique_slug())
        .timestamps()
}

pub fn articles() -> TableDef {
    TableDef::new("articles")
        .column(id())
        .column(ColumnDef::new("title", "TEXT").with("NOT NULL"))
        .column(unique_slug())
        .column(ColumnDef::new("author", "TEXT"))
        .column(ColumnDef::new("body", "TEXT"))
        .column(ColumnDef::new("published_at", "TEXT"))
        .timestamps()
}

pub fn classifications() -> TableDef {
    TableDef::new("classifications")
        .column(id())
        .column(name())
        .column(ColumnDef::new("kind", "TEXT").with("NOT NULL"))
        .column(unique_slug())
        .timestamps()
}

pub fn article_classifications() -> TableDef {
    TableDef::new("article_classifications")
        .column(required_fk("article_id", "articles", "CASCADE"))
        .column(required_fk("classification_id", "classifications", "CASCADE"))
        .constraint("PRIMARY KEY (\"article_id\", \"classification_id\")")
}

// ---- events ----

pub const GAME_STATUS: &str = "game_status";

pub fn game_status_values() -> Vec<String> {
    ["scheduled", "in_progress", "halftime", "final", "postponed", "cancelled"]
        .iter()
        .map(|v| v.to_string())
        .collect()
}

pub fn games() -> TableDef {
    TableDef::new("games")
        .column(id())
        .column(fk("league_id", "leagues", "RESTRICT"))
        .column(ColumnDef::new("season", "INTEGER").with("NOT NULL"))
        .column(required_fk("home_team_id", "teams", "RESTRICT"))
        .column(required_fk("away_team_id", "teams", "RESTRICT"))
        .column(fk("venue_id", "venues", "SET NULL"))
        .column(
            ColumnDef::new("status", "TEXT")
                .with("NOT NULL DEFAULT 'scheduled'")
                .with(format!("REFERENCES \"{GAME_STATUS}\"(\"value\")")),
        )
        .column(ColumnDef::new("scheduled_at", "TEXT"))
        .timestamps()
        .constraint("CHECK (\"home_team_id\" <> \"away_team_id\")")
}

pub fn scores() -> TableDef {
    TableDef::new("scores")
        .column(serial())
        .column(required_fk("game_id", "games", "CASCADE"))
        .column(required_fk("team_id", "teams", "CASCADE"))
        .column(ColumnDef::new("period", "INTEGER").with("NOT NULL"))
        .column(ColumnDef::new("points", "INTEGER").with("NOT NULL DEFAULT 0"))
        .constraint("UNIQUE (\"game_id\", \"team_id\", \"period\")")
}

pub fn drives() -> TableDef {
    TableDef::new("drives")
        .column(serial())
        .column(required_fk("game_id", "games", "CASCADE"))
        .column(fk("team_id", "teams", "SET NULL"))
        .column(ColumnDef::new("sequence", "INTEGER").with("NOT NULL"))
        .column(ColumnDef::new("result", "TEXT"))
        .constraint("UNIQUE (\"game_id\", \"sequence\")")
}

pub fn plays() -> TableDef {
    TableDef::new("plays")
        .column(serial())
        .column(required_fk("game_id", "games", "CASCADE"))
        .column(ColumnDef::new("drive_id", "INTEGER").with("REFERENCES \"drives\"(\"id\") ON DELETE CASCADE"))
        .column(ColumnDef::new("sequence", "INTEGER").with("NOT NULL"))
        .column(ColumnDef::new("period", "INTEGER"))
        .column(ColumnDef::new("clock", "TEXT"))
        .column(ColumnDef::new("description", "TEXT").with("NOT NULL"))
        .constraint("UNIQUE (\"game_id\", \"sequence\")")
}

pub fn event_indexes() -> Vec<IndexDef> {
    vec![
        IndexDef::on("games", &["season", "league_id"]),
        IndexDef::on("games", &["home_team_id"]),
        IndexDef::on("games", &["away_team_id"]),
        IndexDef::on("plays", &["drive_id"]),
    ]
}

// ---- fan features ----

pub fn user_preferences() -> TableDef {
    TableDef::new("user_preferences")
        .column(serial())
        .column(ColumnDef::new("user_id", "TEXT").with("NOT NULL"))
        .column(
            ColumnDef::new("entity_type", "TEXT")
                .with("NOT NULL")
                .with("CHECK (\"entity_type\" IN ('sport', 'league', 'team'))"),
        )
        .column(ColumnDef::new("entity_id", "TEXT").with("NOT NULL"))
        .timestamps()
        .constraint("UNIQUE (\"user_id\", \"entity_type\", \"entity_id\")")
}

pub fn ticket_deals() -> TableDef {
    TableDef::new("ticket_deals")
        .column(id())
        .column(required_fk("game_id", "games", "CASCADE"))
        .column(ColumnDef::new("provider", "TEXT").with("NOT NULL"))
        .column(ColumnDef::new("price_cents", "INTEGER").with("NOT NULL CHECK (\"price_cents\" >= 0)"))
        .column(ColumnDef::new("url", "TEXT"))
        .timestamps()
}

pub fn experiences() -> TableDef {
    TableDef::new("experiences")
        .column(id())
        .column(fk("team_id", "teams", "SET NULL"))
        .column(fk("venue_id", "venues", "SET NULL"))
        .column(ColumnDef::new("title", "TEXT").with("NOT NULL"))
        .column(unique_slug())
        .column(ColumnDef::new("description", "TEXT"))
        .column(ColumnDef::new("price_cents", "INTEGER").with("CHECK (\"price_cents\" IS NULL OR \"price_cents\" >= 0)"))
        .timestamps()
}

pub const UPCOMING_DEALS_VIEW: &str = "upcoming_ticket_deals";

pub fn upcoming_deals_select() -> String {
    "SELECT d.\"id\", d.\"game_id\", d.\"provider\", d.\"price_cents\", g.\"scheduled_at\" \
     FROM \"ticket_deals\" d JOIN \"games\" g ON g.\"id\" = d.\"game_id\" \
     WHERE g.\"status\" = 'scheduled'"
        .to_string()
}

// ---- memberships ----

fn membership(table: &str, parent_column: &str, parent: &str) -> TableDef {
    TableDef::new(table)
        .column(serial())
        .column(required_fk("team_id", "teams", "CASCADE"))
        .column(required_fk(parent_column, parent, "CASCADE"))
        .column(ColumnDef::new("season", "INTEGER").with("NOT NULL"))
        .column(
            ColumnDef::new("is_active", "INTEGER")
                .with("NOT NULL DEFAULT 1")
                .with("CHECK (\"is_active\" IN (0, 1))"),
        )
        .timestamps()
        .constraint(format!("UNIQUE (\"team_id\", \"{parent_column}\", \"season\")"))
}

pub fn team_league_memberships() -> TableDef {
    membership("team_league_memberships", "league_id", "leagues")
}

pub fn team_division_memberships() -> TableDef {
    membership("team_division_memberships", "division_id", "divisions")
}

pub fn membership_indexes() -> Vec<IndexDef> {
    vec![
        IndexDef::on("team_league_memberships", &["league_id", "season"]),
        IndexDef::on("team_league_memberships", &["team_id", "is_active"]),
        IndexDef::on("team_division_memberships", &["division_id", "season"]),
        IndexDef::on("team_division_memberships", &["team_id", "is_active"]),
    ]
}
