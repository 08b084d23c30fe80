use std::time::Duration;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use reqwest::blocking::Client;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const USER_AGENT: &str = concat!("aoe4-meta-sync/", env!("CARGO_PKG_VERSION"));

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared client for stats-API reads. The timeout classifies a hung fetch
/// as a transient failure instead of blocking the run indefinitely.
pub fn http_client() -> Result<&'static Client> {
    CLIENT.get_or_try_init(|| build_client(fetch_timeout_secs()))
}

pub fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build http client")
}

fn fetch_timeout_secs() -> u64 {
    std::env::var("FETCH_TIMEOUT_SECS")
        .ok()
        .and_then(|val| val.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS)
        .clamp(1, 300)
}
