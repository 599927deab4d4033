//! Reference seed rows and market-name hints.

use crate::migration::{MembershipHint, SeedRow, SeedSet, SeedValue};

pub fn sports() -> SeedSet {
    ["Football", "Basketball", "Hockey", "Baseball", "Soccer"]
        .into_iter()
        .fold(SeedSet::new("sports").slugged_from("name"), |set, name| {
            set.row(SeedRow::new().set("name", name))
        })
}

pub fn leagues() -> SeedSet {
    [
        ("NFL", "National Football League", "football"),
        ("NBA", "National Basketball Association", "basketball"),
        ("NHL", "National Hockey League", "hockey"),
        ("MLB", "Major League Baseball", "baseball"),
        ("MLS", "Major League Soccer", "soccer"),
    ]
    .into_iter()
    .fold(
        SeedSet::new("leagues").slugged_from("abbreviation"),
        |set, (abbreviation, name, sport)| {
            set.row(
                SeedRow::new()
                    .set("abbreviation", abbreviation)
                    .set("name", name)
                    .set("sport_id", SeedValue::slug_ref("sports", sport)),
            )
        },
    )
}

pub fn conferences() -> SeedSet {
    [
        ("nfl-afc", "nfl", "AFC"),
        ("nfl-nfc", "nfl", "NFC"),
        ("nba-eastern", "nba", "Eastern Conference"),
        ("nba-western", "nba", "Western Conference"),
        ("nhl-eastern", "nhl", "Eastern Conference"),
        ("nhl-western", "nhl", "Western Conference"),
    ]
    .into_iter()
    .fold(
        SeedSet::new("conferences").slugged_from("name"),
        |set, (id, league, name)| {
            set.row(
                SeedRow::new()
                    .set("id", id)
                    .set("league_id", league)
                    .set("name", name),
            )
        },
    )
}

pub fn divisions() -> SeedSet {
    let mut set = SeedSet::new("divisions").slugged_from("name");
    for (conference, prefix) in [("nfl-afc", "AFC"), ("nfl-nfc", "NFC")] {
        for region in ["North", "South", "East", "West"] {
            set = set.row(
                SeedRow::new()
                    .set("conference_id", conference)
                    .set("name", format!("{prefix} {region}")),
            );
        }
    }
    set
}

/// Market-name pairs for teams known to be missing league memberships,
/// keyed by league id.
/// Several nicknames appear in more than one league; the market prefix and
/// the team's sport disambiguate them.
pub fn league_hints() -> Vec<MembershipHint> {
    [
        ("Baltimore Ravens", "nfl"),
        ("Pittsburgh Steelers", "nfl"),
        ("Kansas City Chiefs", "nfl"),
        ("Carolina Panthers", "nfl"),
        ("New York Giants", "nfl"),
        ("Arizona Cardinals", "nfl"),
        ("Los Angeles Lakers", "nba"),
        ("Boston Celtics", "nba"),
        ("Sacramento Kings", "nba"),
        ("Los Angeles Kings", "nhl"),
        ("Florida Panthers", "nhl"),
        ("New York Rangers", "nhl"),
        ("Texas Rangers", "mlb"),
        ("San Francisco Giants", "mlb"),
        ("St. Louis Cardinals", "mlb"),
        ("Seattle Sounders", "mls"),
    ]
    .into_iter()
    .map(|(market_name, league)| MembershipHint::new(market_name, league))
    .collect()
}
