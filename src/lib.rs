//! Pulls competitive Age of Empires IV statistics (civilization win/pick
//! rates, player leaderboards) from the AoE4 World API, normalizes them into
//! canonical snapshot records, and persists them to Airtable. A second
//! pipeline drives a chat model to produce schema-validated meta-analysis
//! reports from the same statistics.

pub mod civ_names;
pub mod config;
pub mod errors;
pub mod http_client;
pub mod persist;
pub mod records;
pub mod report;
pub mod stats_fetch;
pub mod sync;
