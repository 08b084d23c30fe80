use anyhow::Result;

use aoe4_meta_sync::config::AppConfig;
use aoe4_meta_sync::persist::{IdempotentWriter, make_backend};
use aoe4_meta_sync::report::OpenAiChat;
use aoe4_meta_sync::stats_fetch::StatsApi;
use aoe4_meta_sync::sync::{CancelFlag, ReportRunOptions, run_meta_report};

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cfg = AppConfig::from_env()?;
    let leaderboard = flag_value("--leaderboard").unwrap_or_else(|| "rm_solo".to_string());

    let api = StatsApi::new(&cfg.stats);
    let backend = make_backend(&cfg.store)?;
    let writer = IdempotentWriter::new(backend, cfg.store.write_attempts);
    let model = OpenAiChat::new(&cfg.model)?;

    let opts = ReportRunOptions {
        table: cfg.store.reports_table.clone(),
        leaderboard,
        map_type: "Open".to_string(),
        extremes: 5,
        guide_count: 3,
        max_retries: cfg.model.max_retries,
    };

    let summary = run_meta_report(&api, &writer, &model, &opts, &CancelFlag::new())?;
    println!("Meta analysis complete");
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
