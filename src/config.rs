use std::env;

use anyhow::{Result, anyhow};

const DEFAULT_STATS_API_BASE: &str = "https://aoe4world.com/api/v0";
const DEFAULT_STORE_API_BASE: &str = "https://api.airtable.com/v0";
const DEFAULT_BASE_ID: &str = "appKeqSFMnexidZfd";
const DEFAULT_MODEL_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4.1-mini";
const DEFAULT_HELPER_PROGRAM: &str = "manus-mcp-cli";

const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_GENERATION_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Extra attempts after the first on a transient failure.
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackendKind {
    Rest,
    Helper,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    pub api_base: String,
    pub base_id: String,
    pub token: String,
    pub helper_program: String,
    pub civ_stats_table: String,
    pub players_table: String,
    pub reports_table: String,
    /// Total attempts per record for retryable write failures.
    pub write_attempts: u32,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: f32,
    pub timeout_secs: u64,
    /// Retries after the first generation attempt fails validation.
    pub max_retries: u32,
}

impl ModelConfig {
    pub fn require_api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY environment variable not set"))
    }
}

/// Everything read from the environment, once, at process start. Components
/// receive the slices they need instead of reading globals themselves.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub stats: StatsConfig,
    pub store: StoreConfig,
    pub model: ModelConfig,
    pub persist_parallelism: usize,
    pub leaderboard_top_n: usize,
}

impl AppConfig {
    /// Fails before any network call when the store credential is missing.
    pub fn from_env() -> Result<Self> {
        let token = env::var("AIRTABLE_ACCESS_TOKEN")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("AIRTABLE_ACCESS_TOKEN environment variable not set"))?;

        let backend = match env_string("STORE_BACKEND", "rest").to_ascii_lowercase().as_str() {
            "rest" => StoreBackendKind::Rest,
            "helper" => StoreBackendKind::Helper,
            other => {
                return Err(anyhow!(
                    "unsupported STORE_BACKEND={other}, expected rest or helper"
                ));
            }
        };

        let stats = StatsConfig {
            base_url: env_string("STATS_API_BASE", DEFAULT_STATS_API_BASE),
            timeout_secs: env_u64("FETCH_TIMEOUT_SECS", DEFAULT_FETCH_TIMEOUT_SECS).clamp(1, 300),
            retries: env_u64("FETCH_RETRIES", 2).min(10) as u32,
        };

        let store = StoreConfig {
            backend,
            api_base: env_string("AIRTABLE_API_BASE", DEFAULT_STORE_API_BASE),
            base_id: env_string("AIRTABLE_BASE_ID", DEFAULT_BASE_ID),
            token,
            helper_program: env_string("STORE_HELPER_CMD", DEFAULT_HELPER_PROGRAM),
            civ_stats_table: env_string("CIV_STATS_TABLE", "Civilization Meta Stats"),
            players_table: env_string("PLAYERS_TABLE", "Leaderboard Players"),
            reports_table: env_string("REPORTS_TABLE", "Strategy Analysis"),
            write_attempts: env_u64("WRITE_ATTEMPTS", 3).clamp(1, 10) as u32,
        };

        let model = ModelConfig {
            api_base: env_string("OPENAI_API_BASE", DEFAULT_MODEL_API_BASE),
            api_key: env::var("OPENAI_API_KEY")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            model: env_string("OPENAI_MODEL", DEFAULT_MODEL),
            temperature: env::var("MODEL_TEMPERATURE")
                .ok()
                .and_then(|v| v.trim().parse::<f32>().ok())
                .unwrap_or(0.7)
                .clamp(0.0, 2.0),
            timeout_secs: env_u64("GENERATION_TIMEOUT_SECS", DEFAULT_GENERATION_TIMEOUT_SECS)
                .clamp(1, 600),
            max_retries: env_u64("GENERATION_RETRIES", 2).min(10) as u32,
        };

        Ok(Self {
            stats,
            store,
            model,
            persist_parallelism: env_u64("PERSIST_PARALLELISM", 6).clamp(1, 16) as usize,
            leaderboard_top_n: env_u64("LEADERBOARD_TOP_N", 50).clamp(1, 1000) as usize,
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}
