use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::civ_names::canonical_civ_name;
use crate::stats_fetch::{RawCivStat, RawPlayer};

/// Run-scoped stamps shared by every record built from one fetch.
#[derive(Debug, Clone)]
pub struct SnapshotContext {
    pub leaderboard: String,
    pub rank_level: Option<String>,
    pub patch: String,
    pub captured_at: DateTime<Utc>,
}

impl SnapshotContext {
    pub fn new(leaderboard: &str, rank_level: Option<&str>, patch: &str) -> Self {
        Self {
            leaderboard: leaderboard.to_string(),
            rank_level: rank_level.map(str::to_string),
            patch: patch.to_string(),
            captured_at: Utc::now(),
        }
    }

    pub fn rank_level_label(&self) -> &str {
        self.rank_level.as_deref().unwrap_or("All Ranks")
    }

    pub fn time_bucket(&self) -> String {
        time_bucket(&self.captured_at)
    }
}

/// Capture-hour bucket used in idempotency keys. Snapshots are an
/// append-only time series at hour granularity: re-runs inside the same hour
/// dedupe, a new hour gets a new row per entity.
pub fn time_bucket(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H").to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct CivilizationStat {
    pub civ_id: String,
    pub civilization: String,
    pub leaderboard: String,
    pub rank_level: String,
    pub win_rate: f64,
    pub pick_rate: f64,
    pub games_count: u64,
    pub avg_game_duration: u64,
    pub patch: String,
    pub last_updated: String,
}

impl CivilizationStat {
    pub fn entity_key(&self) -> String {
        format!("{}|{}|{}", self.civ_id, self.leaderboard, self.rank_level)
    }

    pub fn fields(&self) -> Value {
        json!({
            "civilization": self.civilization,
            "leaderboard": self.leaderboard,
            "rank_level": self.rank_level,
            "win_rate": self.win_rate,
            "pick_rate": self.pick_rate,
            "games_count": self.games_count,
            "avg_game_duration": self.avg_game_duration,
            "patch": self.patch,
            "last_updated": self.last_updated,
        })
    }
}

pub fn build_civ_stat(raw: &RawCivStat, ctx: &SnapshotContext) -> CivilizationStat {
    CivilizationStat {
        civ_id: raw.civilization.clone(),
        civilization: canonical_civ_name(&raw.civilization),
        leaderboard: ctx.leaderboard.clone(),
        rank_level: ctx.rank_level_label().to_string(),
        win_rate: round2(clamp_pct(raw.win_rate)),
        pick_rate: round2(clamp_pct(raw.pick_rate)),
        games_count: raw.games_count.max(0) as u64,
        avg_game_duration: non_negative_secs(raw.duration_average),
        patch: ctx.patch.clone(),
        last_updated: ctx.captured_at.to_rfc3339(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerRecord {
    pub player_name: String,
    pub profile_id: i64,
    pub rank: u64,
    pub rating: i64,
    pub rank_level: String,
    pub win_rate: f64,
    pub games_count: u64,
    pub leaderboard: String,
    pub country: String,
    pub last_game: String,
}

impl PlayerRecord {
    pub fn entity_key(&self) -> String {
        format!("{}|{}", self.profile_id, self.leaderboard)
    }

    pub fn fields(&self) -> Value {
        json!({
            "player_name": self.player_name,
            "profile_id": self.profile_id,
            "rank": self.rank,
            "rating": self.rating,
            "rank_level": self.rank_level,
            "win_rate": self.win_rate,
            "games_count": self.games_count,
            "leaderboard": self.leaderboard,
            "country": self.country,
            "last_game": self.last_game,
        })
    }
}

pub fn build_player_record(raw: &RawPlayer, leaderboard: &str) -> PlayerRecord {
    let wins = raw.wins.max(0) as u64;
    let losses = raw.losses.max(0) as u64;
    let games = wins + losses;
    // Brand-new accounts have no games; their win rate is 0, not NaN.
    let win_rate = if games == 0 {
        0.0
    } else {
        round2(wins as f64 / games as f64 * 100.0)
    };

    PlayerRecord {
        player_name: non_empty_or(&raw.name, "Unknown"),
        profile_id: raw.profile_id,
        rank: raw.rank.max(0) as u64,
        rating: raw.rating,
        rank_level: non_empty_or(&raw.rank_level, "Unknown"),
        win_rate,
        games_count: games,
        leaderboard: leaderboard.to_string(),
        country: raw.country.clone(),
        last_game: raw.last_game_at.clone(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetaReport {
    pub title: String,
    pub civilization: String,
    pub matchup_vs: String,
    pub map_type: String,
    pub early_game: String,
    pub mid_game: String,
    pub late_game: String,
    pub key_units: String,
    pub key_technologies: String,
    pub ai_confidence: u8,
    pub ai_reasoning: String,
    pub patch: String,
}

impl MetaReport {
    pub fn entity_key(&self) -> String {
        format!("{}|{}", self.civilization, self.matchup_vs)
    }

    pub fn fields(&self) -> Value {
        json!({
            "title": self.title,
            "civilization": self.civilization,
            "matchup_vs": self.matchup_vs,
            "map_type": self.map_type,
            "early_game": self.early_game,
            "mid_game": self.mid_game,
            "late_game": self.late_game,
            "key_units": self.key_units,
            "key_technologies": self.key_technologies,
            "ai_confidence": self.ai_confidence,
            "ai_reasoning": self.ai_reasoning,
            "patch": self.patch,
        })
    }
}

fn clamp_pct(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn non_negative_secs(value: f64) -> u64 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    value.round() as u64
}

fn non_empty_or(value: &str, default: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> SnapshotContext {
        SnapshotContext::new("rm_solo", None, "12.1")
    }

    fn raw_civ(win: f64, pick: f64) -> RawCivStat {
        RawCivStat {
            civilization: "mongols".to_string(),
            win_rate: win,
            pick_rate: pick,
            games_count: 1234,
            duration_average: 1820.6,
        }
    }

    #[test]
    fn rates_are_clamped_and_rounded_to_two_decimals() {
        let stat = build_civ_stat(&raw_civ(52.4567, 130.0), &ctx());
        assert_eq!(stat.win_rate, 52.46);
        assert_eq!(stat.pick_rate, 100.0);

        let stat = build_civ_stat(&raw_civ(-3.2, f64::NAN), &ctx());
        assert_eq!(stat.win_rate, 0.0);
        assert_eq!(stat.pick_rate, 0.0);
    }

    #[test]
    fn counts_never_go_negative() {
        let raw = RawCivStat {
            civilization: "rus".to_string(),
            win_rate: 50.0,
            pick_rate: 5.0,
            games_count: -7,
            duration_average: -12.0,
        };
        let stat = build_civ_stat(&raw, &ctx());
        assert_eq!(stat.games_count, 0);
        assert_eq!(stat.avg_game_duration, 0);
    }

    #[test]
    fn context_stamps_flow_into_the_record() {
        let ctx = SnapshotContext::new("rm_team", Some("conqueror"), "12.1");
        let stat = build_civ_stat(&raw_civ(50.0, 5.0), &ctx);
        assert_eq!(stat.leaderboard, "rm_team");
        assert_eq!(stat.rank_level, "conqueror");
        assert_eq!(stat.patch, "12.1");
        assert_eq!(stat.last_updated, ctx.captured_at.to_rfc3339());
        assert_eq!(stat.civilization, "Mongols");
    }

    #[test]
    fn unfiltered_rank_level_reads_all_ranks() {
        let stat = build_civ_stat(&raw_civ(50.0, 5.0), &ctx());
        assert_eq!(stat.rank_level, "All Ranks");
    }

    fn raw_player(wins: i64, losses: i64) -> RawPlayer {
        RawPlayer {
            name: "TheViper".to_string(),
            profile_id: 459658,
            rank: 1,
            rating: 2215,
            rank_level: "conqueror_3".to_string(),
            wins,
            losses,
            country: "no".to_string(),
            last_game_at: "2026-08-05T19:04:00Z".to_string(),
        }
    }

    #[test]
    fn player_win_rate_is_derived() {
        let record = build_player_record(&raw_player(2, 1), "rm_solo");
        assert_eq!(record.win_rate, 66.67);
        assert_eq!(record.games_count, 3);
    }

    #[test]
    fn zero_games_means_zero_win_rate() {
        let record = build_player_record(&raw_player(0, 0), "rm_solo");
        assert_eq!(record.win_rate, 0.0);
        assert!(!record.win_rate.is_nan());
        assert_eq!(record.games_count, 0);
    }

    #[test]
    fn blank_player_fields_get_placeholders() {
        let mut raw = raw_player(1, 1);
        raw.name = "  ".to_string();
        raw.rank_level = String::new();
        let record = build_player_record(&raw, "rm_solo");
        assert_eq!(record.player_name, "Unknown");
        assert_eq!(record.rank_level, "Unknown");
    }

    #[test]
    fn entity_keys_are_stable_per_snapshot_dimension() {
        let stat = build_civ_stat(&raw_civ(50.0, 5.0), &ctx());
        assert_eq!(stat.entity_key(), "mongols|rm_solo|All Ranks");
        let record = build_player_record(&raw_player(1, 0), "rm_solo");
        assert_eq!(record.entity_key(), "459658|rm_solo");
    }

    #[test]
    fn time_bucket_is_hour_granular() {
        let at = DateTime::parse_from_rfc3339("2026-08-06T14:59:31Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(time_bucket(&at), "2026-08-06T14");
    }

    #[test]
    fn civ_fields_match_the_table_schema() {
        let stat = build_civ_stat(&raw_civ(50.0, 5.0), &ctx());
        let fields = stat.fields();
        let obj = fields.as_object().unwrap();
        for key in [
            "civilization",
            "leaderboard",
            "rank_level",
            "win_rate",
            "pick_rate",
            "games_count",
            "avg_game_duration",
            "patch",
            "last_updated",
        ] {
            assert!(obj.contains_key(key), "missing field {key}");
        }
    }
}
