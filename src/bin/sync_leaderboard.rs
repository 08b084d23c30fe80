use anyhow::Result;

use aoe4_meta_sync::config::AppConfig;
use aoe4_meta_sync::persist::{IdempotentWriter, make_backend};
use aoe4_meta_sync::stats_fetch::StatsApi;
use aoe4_meta_sync::sync::{CancelFlag, LeaderboardSyncOptions, run_leaderboard_sync};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cfg = AppConfig::from_env()?;
    let leaderboard = flag_value("--leaderboard").unwrap_or_else(|| "rm_solo".to_string());
    let page = flag_value("--page")
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(1);
    let top_n = flag_value("--top-n")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(cfg.leaderboard_top_n);

    let api = StatsApi::new(&cfg.stats);
    let backend = make_backend(&cfg.store)?;
    let writer = IdempotentWriter::new(backend, cfg.store.write_attempts);

    let opts = LeaderboardSyncOptions {
        table: cfg.store.players_table.clone(),
        leaderboard,
        page,
        top_n,
        parallelism: cfg.persist_parallelism,
    };

    let summary = run_leaderboard_sync(&api, &writer, &opts, &CancelFlag::new())?;
    println!(
        "Leaderboard sync complete via {} backend",
        writer.backend_name()
    );
    println!("{summary}");
    Ok(())
}

fn flag_value(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let prefix = format!("{name}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix(&prefix) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}
