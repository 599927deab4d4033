//! The built-in migration chain for the sports platform schema.
//!
//! Eight steps take an empty database to the current schema:
//!
//! | Step | Purpose |
//! |------|---------|
//! | `001_reference_tables` | sports, leagues, conferences, divisions, teams |
//! | `002_venues_and_content` | venues, articles, classifications |
//! | `003_event_tables` | `game_status` enum, games, scores, drives, plays |
//! | `004_fan_features` | preferences, ticket deals, experiences |
//! | `005_memberships` | team-league/division memberships, backfill from `teams.league_id` |
//! | `006_reference_seeds` | sports, leagues, conferences, divisions |
//! | `007_drop_teams_league_id` | rebuild `teams` without the deprecated column |
//! | `008_repair_league_memberships` | heuristic membership repair |

mod seeds;
mod tables;

use crate::migration::{
    MembershipTable, MigrationChain, MigrationError, MigrationStep, Operation, OrphanCheck,
    RebuildSpec, RepairSource, RepairSpec,
};
use crate::schema::{IndexDef, TableDef};

/// Season membership repairs are scoped to.
pub const MEMBERSHIP_SEASON: i64 = 2024;

pub const REFERENCE_TABLES: &str = "001_reference_tables";
pub const VENUES_AND_CONTENT: &str = "002_venues_and_content";
pub const EVENT_TABLES: &str = "003_event_tables";
pub const FAN_FEATURES: &str = "004_fan_features";
pub const MEMBERSHIPS: &str = "005_memberships";
pub const REFERENCE_SEEDS: &str = "006_reference_seeds";
pub const DROP_TEAMS_LEAGUE_ID: &str = "007_drop_teams_league_id";
pub const REPAIR_LEAGUE_MEMBERSHIPS: &str = "008_repair_league_memberships";

/// The team-to-league membership table.
pub fn league_membership() -> MembershipTable {
    MembershipTable::new("team_league_memberships", "team_id", "league_id")
}

/// The team-to-division membership table.
pub fn division_membership() -> MembershipTable {
    MembershipTable::new("team_division_memberships", "team_id", "division_id")
}

/// Orphan scan for teams without an active league membership this season.
pub fn league_orphan_check() -> OrphanCheck {
    OrphanCheck {
        entity_table: "teams".to_string(),
        membership: league_membership(),
        season: Some(MEMBERSHIP_SEASON),
    }
}

/// All built-in steps, in chain order.
pub fn builtin_steps() -> Vec<MigrationStep> {
    vec![
        reference_tables(),
        venues_and_content(),
        event_tables(),
        fan_features(),
        memberships(),
        reference_seeds(),
        drop_teams_league_id(),
        repair_league_memberships(),
    ]
}

/// The validated built-in chain.
pub fn builtin_chain() -> Result<MigrationChain, MigrationError> {
    MigrationChain::new(builtin_steps())
}

fn create_all(step: MigrationStep, defs: Vec<TableDef>, indexes: Vec<IndexDef>) -> MigrationStep {
    let mut step = step;
    for def in &defs {
        step = step.forward(Operation::CreateTable(def.clone()));
        if def.has_column("updated_at") {
            step = step.forward(Operation::CreateTouchTrigger {
                table: def.name.clone(),
            });
        }
    }
    for index in indexes {
        step = step.forward(Operation::CreateIndex(index));
    }
    for def in defs.iter().rev() {
        step = step.reverse(Operation::DropTable {
            name: def.name.clone(),
        });
    }
    step
}

fn reference_tables() -> MigrationStep {
    create_all(
        MigrationStep::new(REFERENCE_TABLES, None, "Create sports, leagues, conferences, divisions and teams"),
        vec![
            tables::sports(),
            tables::leagues(),
            tables::conferences(),
            tables::divisions(),
            tables::teams(true),
        ],
        tables::reference_indexes(),
    )
}

fn venues_and_content() -> MigrationStep {
    create_all(
        MigrationStep::new(
            VENUES_AND_CONTENT,
            Some(REFERENCE_TABLES),
            "Create venues, articles and classifications",
        ),
        vec![
            tables::venues(),
            tables::articles(),
            tables::classifications(),
            tables::article_classifications(),
        ],
        vec![IndexDef::on("articles", &["published_at"])],
    )
}

fn event_tables() -> MigrationStep {
    let step = MigrationStep::new(
        EVENT_TABLES,
        Some(VENUES_AND_CONTENT),
        "Create the game_status enum and game, score, drive and play tables",
    )
    .requires_table("teams")
    .requires_table("venues")
    .forward(Operation::CreateEnum {
        name: tables::GAME_STATUS.to_string(),
        values: tables::game_status_values(),
    });

    create_all(
        step,
        vec![tables::games(), tables::scores(), tables::drives(), tables::plays()],
        tables::event_indexes(),
    )
    .reverse(Operation::DropTable {
        name: tables::GAME_STATUS.to_string(),
    })
}

fn fan_features() -> MigrationStep {
    let step = MigrationStep::new(
        FAN_FEATURES,
        Some(EVENT_TABLES),
        "Create user preferences, ticket deals and experiences",
    )
    .requires_table("games")
    .requires_table("teams")
    .reverse(Operation::DropView {
        name: tables::UPCOMING_DEALS_VIEW.to_string(),
    });

    create_all(
        step,
        vec![tables::user_preferences(), tables::ticket_deals(), tables::experiences()],
        vec![
            IndexDef::on("user_preferences", &["user_id"]),
            IndexDef::on("ticket_deals", &["game_id"]),
        ],
    )
    .forward(Operation::CreateView {
        name: tables::UPCOMING_DEALS_VIEW.to_string(),
        select: tables::upcoming_deals_select(),
    })
}

fn memberships() -> MigrationStep {
    let step = MigrationStep::new(
        MEMBERSHIPS,
        Some(FAN_FEATURES),
        "Create membership tables and backfill league memberships from teams.league_id",
    )
    .requires_table("teams")
    .requires_table("leagues")
    .requires_table("divisions");

    create_all(
        step,
        vec![tables::team_league_memberships(), tables::team_division_memberships()],
        tables::membership_indexes(),
    )
    .forward(Operation::Repair(RepairSpec {
        entity_table: "teams".to_string(),
        parent_table: "leagues".to_string(),
        membership: league_membership(),
        season: MEMBERSHIP_SEASON,
        source: RepairSource::Column {
            column: "league_id".to_string(),
        },
    }))
}

fn reference_seeds() -> MigrationStep {
    let sets = [
        seeds::sports(),
        seeds::leagues(),
        seeds::conferences(),
        seeds::divisions(),
    ];
    let mut step = MigrationStep::new(
        REFERENCE_SEEDS,
        Some(MEMBERSHIPS),
        "Seed sports, leagues, conferences and divisions",
    )
    .requires_table("sports")
    .requires_table("leagues")
    .requires_table("conferences")
    .requires_table("divisions");

    for set in &sets {
        step = step.forward(Operation::Seed(set.clone()));
    }
    for set in sets.iter().rev() {
        step = step.reverse(Operation::DeleteSeeded {
            table: set.table.clone(),
        });
    }
    step
}

fn drop_teams_league_id() -> MigrationStep {
    MigrationStep::new(
        DROP_TEAMS_LEAGUE_ID,
        Some(REFERENCE_SEEDS),
        "Rebuild teams without the deprecated league_id column",
    )
    .requires_table("teams")
    .requires_table("team_league_memberships")
    .requires_column("teams", "league_id")
    .forward(Operation::RebuildTable(RebuildSpec::new(tables::teams(false))))
    .expects_removed("teams", "league_id")
    .expects_preserved("teams")
    .expects_preserved("team_league_memberships")
    .reverse(Operation::RebuildTable(
        RebuildSpec::new(tables::teams(true)).index(IndexDef::on("teams", &["league_id"])),
    ))
    .reverse(Operation::Execute {
        sql: "UPDATE \"teams\" SET \"league_id\" = (\
              SELECT m.\"league_id\" FROM \"team_league_memberships\" m \
              WHERE m.\"team_id\" = \"teams\".\"id\" AND m.\"is_active\" = 1 \
              ORDER BY m.\"season\" DESC, m.\"id\" LIMIT 1)"
            .to_string(),
        touches: vec!["teams".to_string()],
    })
}

fn repair_league_memberships() -> MigrationStep {
    MigrationStep::new(
        REPAIR_LEAGUE_MEMBERSHIPS,
        Some(DROP_TEAMS_LEAGUE_ID),
        "Backfill missing league memberships by market name",
    )
    .requires_table("teams")
    .requires_table("team_league_memberships")
    .requires_rows("leagues", 1)
    .forward(Operation::Repair(RepairSpec {
        entity_table: "teams".to_string(),
        parent_table: "leagues".to_string(),
        membership: league_membership(),
        season: MEMBERSHIP_SEASON,
        source: RepairSource::Heuristic {
            hints: seeds::league_hints(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_builtin_chain_is_linear() {
        let chain = builtin_chain().unwrap();
        assert_eq!(chain.len(), 8);
        assert_eq!(chain.root().id, REFERENCE_TABLES);
        assert_eq!(chain.tip().id, REPAIR_LEAGUE_MEMBERSHIPS);
        assert_eq!(chain.walk_length(), chain.len());
    }

    #[test]
    fn test_checksums_are_distinct() {
        let checksums: HashSet<String> = builtin_steps().iter().map(|s| s.checksum()).collect();
        assert_eq!(checksums.len(), 8);
    }

    #[test]
    fn test_every_step_has_a_reverse_except_repair() {
        for step in builtin_steps() {
            if step.id == REPAIR_LEAGUE_MEMBERSHIPS {
                assert!(step.reverse.is_empty());
            } else {
                assert!(!step.reverse.is_empty(), "{} has no reverse", step.id);
            }
        }
    }

    #[test]
    fn test_reference_seeds_reverse_in_dependency_order() {
        let step = reference_seeds();
        let tables: Vec<&str> = step
            .reverse
            .iter()
            .map(|op| match op {
                Operation::DeleteSeeded { table } => table.as_str(),
                other => panic!("unexpected reverse op {other:?}"),
            })
            .collect();
        assert_eq!(tables, vec!["divisions", "conferences", "leagues", "sports"]);
    }
}
