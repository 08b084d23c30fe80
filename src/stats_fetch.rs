use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Deserializer};

use crate::config::StatsConfig;
use crate::errors::FetchError;
use crate::http_client::http_client;

const RETRY_PAUSE_MS: u64 = 500;

/// One civilization's aggregate row as the API returns it. Numeric fields
/// default to zero when absent; the record builder coerces them further.
#[derive(Debug, Clone, Deserialize)]
pub struct RawCivStat {
    pub civilization: String,
    #[serde(default)]
    pub win_rate: f64,
    #[serde(default)]
    pub pick_rate: f64,
    #[serde(default)]
    pub games_count: i64,
    #[serde(default)]
    pub duration_average: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CivStatsPayload {
    pub data: Vec<RawCivStat>,
    #[serde(deserialize_with = "string_or_number")]
    pub patch: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawPlayer {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub profile_id: i64,
    #[serde(default)]
    pub rank: i64,
    #[serde(default)]
    pub rating: i64,
    #[serde(default)]
    pub rank_level: String,
    #[serde(default)]
    pub wins: i64,
    #[serde(default)]
    pub losses: i64,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub last_game_at: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardPayload {
    pub players: Vec<RawPlayer>,
}

/// `data` and `patch` are required; anything else is a payload we do not
/// understand and must not guess at.
pub fn parse_civ_stats_json(raw: &str) -> Result<CivStatsPayload, FetchError> {
    serde_json::from_str(raw)
        .map_err(|err| FetchError::Malformed(format!("civilization stats payload: {err}")))
}

pub fn parse_leaderboard_json(raw: &str) -> Result<LeaderboardPayload, FetchError> {
    serde_json::from_str(raw)
        .map_err(|err| FetchError::Malformed(format!("leaderboard payload: {err}")))
}

/// Read seam for the sync runs, so they can be driven from fixtures.
pub trait StatsSource {
    fn civilization_stats(
        &self,
        leaderboard: &str,
        rank_level: Option<&str>,
    ) -> Result<CivStatsPayload, FetchError>;

    fn leaderboard_page(&self, leaderboard: &str, page: u32)
    -> Result<LeaderboardPayload, FetchError>;
}

/// Live AoE4 World API reader.
pub struct StatsApi {
    base_url: String,
    attempts: u32,
}

impl StatsApi {
    pub fn new(cfg: &StatsConfig) -> Self {
        Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            attempts: cfg.retries + 1,
        }
    }

    fn fetch_text(&self, url: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        let mut last_err = None;
        for attempt in 0..self.attempts {
            if attempt > 0 {
                std::thread::sleep(Duration::from_millis(RETRY_PAUSE_MS * attempt as u64));
            }
            match self.fetch_once(url, query) {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() => {
                    log::debug!("fetch attempt {} failed for {url}: {err}", attempt + 1);
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| FetchError::Transient("no attempts made".to_string())))
    }

    fn fetch_once(&self, url: &str, query: &[(&str, &str)]) -> Result<String, FetchError> {
        let client = http_client().map_err(|err| FetchError::Transient(err.to_string()))?;
        let resp = client
            .get(url)
            .query(query)
            .send()
            .map_err(|err| FetchError::Transient(format!("request failed: {err}")))?;
        let status = resp.status();
        let body = resp
            .text()
            .map_err(|err| FetchError::Transient(format!("failed reading body: {err}")))?;
        classify_status(status, url)?;
        Ok(body)
    }
}

fn classify_status(status: StatusCode, url: &str) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(FetchError::Transient(format!("http {status} from {url}")));
    }
    Err(FetchError::Malformed(format!("http {status} from {url}")))
}

impl StatsSource for StatsApi {
    fn civilization_stats(
        &self,
        leaderboard: &str,
        rank_level: Option<&str>,
    ) -> Result<CivStatsPayload, FetchError> {
        let url = format!("{}/stats/{leaderboard}/civilizations", self.base_url);
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(level) = rank_level {
            query.push(("rank_level", level));
        }
        let body = self.fetch_text(&url, &query)?;
        parse_civ_stats_json(&body)
    }

    fn leaderboard_page(
        &self,
        leaderboard: &str,
        page: u32,
    ) -> Result<LeaderboardPayload, FetchError> {
        let url = format!("{}/leaderboards/{leaderboard}", self.base_url);
        let page = page.to_string();
        let body = self.fetch_text(&url, &[("page", page.as_str())])?;
        parse_leaderboard_json(&body)
    }
}

/// Patch labels have shown up both as strings and bare numbers.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "patch must be a string or number, got {other}"
        ))),
    }
}
