use std::fs;
use std::path::PathBuf;

use aoe4_meta_sync::errors::FetchError;
use aoe4_meta_sync::stats_fetch::{parse_civ_stats_json, parse_leaderboard_json};

fn read_fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests");
    path.push("fixtures");
    path.push(name);
    fs::read_to_string(path).expect("fixture file should be readable")
}

#[test]
fn parses_civ_stats_fixture() {
    let raw = read_fixture("civ_stats.json");
    let payload = parse_civ_stats_json(&raw).expect("fixture should parse");
    assert_eq!(payload.patch, "12.1.2941");
    assert_eq!(payload.data.len(), 4);

    let mongols = &payload.data[0];
    assert_eq!(mongols.civilization, "mongols");
    assert_eq!(mongols.win_rate, 54.2371);
    assert_eq!(mongols.games_count, 18342);

    // Fields the fixture omits default instead of failing the whole payload.
    let sparse = &payload.data[3];
    assert_eq!(sparse.civilization, "new_faction_x");
    assert_eq!(sparse.pick_rate, 0.0);
    assert_eq!(sparse.duration_average, 0.0);
}

#[test]
fn parses_leaderboard_fixture() {
    let raw = read_fixture("leaderboard.json");
    let payload = parse_leaderboard_json(&raw).expect("fixture should parse");
    assert_eq!(payload.players.len(), 3);

    let top = &payload.players[0];
    assert_eq!(top.name, "TheViper");
    assert_eq!(top.profile_id, 459658);
    assert_eq!(top.rank, 1);
    assert_eq!(top.wins, 812);

    // Fresh account with no games and no name yet.
    let fresh = &payload.players[2];
    assert!(fresh.name.is_empty());
    assert_eq!(fresh.wins, 0);
    assert_eq!(fresh.losses, 0);
}

#[test]
fn payloads_missing_required_keys_are_malformed() {
    assert!(matches!(
        parse_civ_stats_json(r#"{"data": []}"#).unwrap_err(),
        FetchError::Malformed(_)
    ));
    assert!(matches!(
        parse_civ_stats_json(r#"{"patch": "12.1"}"#).unwrap_err(),
        FetchError::Malformed(_)
    ));
    assert!(matches!(
        parse_leaderboard_json(r#"{"page": 1}"#).unwrap_err(),
        FetchError::Malformed(_)
    ));
}

#[test]
fn unexpected_extra_keys_are_ignored() {
    let raw = r#"{"data": [], "patch": "12.1", "total_count": 22, "query": {"page": 1}}"#;
    let payload = parse_civ_stats_json(raw).expect("extra keys should not break parsing");
    assert!(payload.data.is_empty());
}
