use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use rayon::prelude::*;

use crate::persist::{IdempotentWriter, WriteOutcome, idempotency_key};
use crate::records::{
    CivilizationStat, MetaReport, SnapshotContext, build_civ_stat, build_player_record, time_bucket,
};
use crate::report::{
    ChatModel, GUIDE_SYSTEM_ROLE, META_SYSTEM_ROLE, ReportSections, build_civ_guide_prompt,
    build_meta_prompt, generate_report,
};
use crate::stats_fetch::StatsSource;

/// Run-level cancellation. Setting it stops new writes and generation calls;
/// whatever is already in flight finishes or times out on its own.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, AtomicOrdering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub fetched: usize,
    pub persisted: usize,
    pub failed: usize,
    /// Duplicates suppressed by the idempotency key plus writes not issued
    /// after cancellation.
    pub skipped: usize,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "fetched={} persisted={} failed={} skipped={}",
            self.fetched, self.persisted, self.failed, self.skipped
        )
    }
}

#[derive(Debug, Clone)]
pub struct StatsSyncOptions {
    pub table: String,
    pub leaderboard: String,
    pub rank_level: Option<String>,
    pub parallelism: usize,
}

#[derive(Debug, Clone)]
pub struct LeaderboardSyncOptions {
    pub table: String,
    pub leaderboard: String,
    pub page: u32,
    pub top_n: usize,
    pub parallelism: usize,
}

#[derive(Debug, Clone)]
pub struct ReportRunOptions {
    pub table: String,
    pub leaderboard: String,
    pub map_type: String,
    /// Size of each of the top and bottom selections fed to the prompt.
    pub extremes: usize,
    /// How many of the top civilizations get an individual guide.
    pub guide_count: usize,
    pub max_retries: u32,
}

enum PersistOutcome {
    Persisted,
    Duplicate,
    Skipped,
    Failed,
    Fatal(String),
}

/// Fetch once, build one snapshot row per civilization, persist each row
/// independently under the bounded pool. One row failing does not abort its
/// siblings; an auth or schema failure stops the whole run.
pub fn run_civ_stats_sync(
    source: &dyn StatsSource,
    writer: &IdempotentWriter,
    opts: &StatsSyncOptions,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    let payload = source
        .civilization_stats(&opts.leaderboard, opts.rank_level.as_deref())
        .context("civilization stats fetch failed")?;
    if payload.data.is_empty() {
        return Err(anyhow!(
            "stats fetch returned zero civilizations for {}",
            opts.leaderboard
        ));
    }

    let ctx = SnapshotContext::new(&opts.leaderboard, opts.rank_level.as_deref(), &payload.patch);
    let bucket = ctx.time_bucket();
    let records: Vec<CivilizationStat> = payload
        .data
        .iter()
        .map(|raw| build_civ_stat(raw, &ctx))
        .collect();
    log::info!(
        "fetched {} civilizations for {} ({}), patch {}",
        records.len(),
        ctx.leaderboard,
        ctx.rank_level_label(),
        ctx.patch
    );

    let outcomes = with_persist_pool(opts.parallelism, || {
        records
            .par_iter()
            .map(|record| {
                let key =
                    idempotency_key(&opts.table, &record.entity_key(), &record.patch, &bucket);
                persist_record(
                    writer,
                    &opts.table,
                    &record.fields(),
                    &key,
                    &format!("civilization {}", record.civ_id),
                    cancel,
                )
            })
            .collect()
    });

    tally(records.len(), outcomes)
}

/// Fetch one leaderboard page, keep at most `top_n` players (a short page is
/// processed as-is, never padded), persist per player with the same
/// continue-on-error policy as the stats sync.
pub fn run_leaderboard_sync(
    source: &dyn StatsSource,
    writer: &IdempotentWriter,
    opts: &LeaderboardSyncOptions,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    let payload = source
        .leaderboard_page(&opts.leaderboard, opts.page)
        .context("leaderboard fetch failed")?;
    if payload.players.is_empty() {
        return Err(anyhow!(
            "leaderboard page {} returned zero players for {}",
            opts.page,
            opts.leaderboard
        ));
    }

    let mut players = payload.players;
    if players.len() > opts.top_n {
        players.truncate(opts.top_n);
    }
    log::info!(
        "processing {} players from {} page {} (top {} requested)",
        players.len(),
        opts.leaderboard,
        opts.page,
        opts.top_n
    );

    let bucket = time_bucket(&Utc::now());
    let records: Vec<_> = players
        .iter()
        .map(|raw| build_player_record(raw, &opts.leaderboard))
        .collect();

    let outcomes = with_persist_pool(opts.parallelism, || {
        records
            .par_iter()
            .map(|record| {
                // Leaderboard rows are not patch-scoped; the bucket alone
                // separates snapshots over time.
                let key = idempotency_key(&opts.table, &record.entity_key(), "", &bucket);
                persist_record(
                    writer,
                    &opts.table,
                    &record.fields(),
                    &key,
                    &format!("player {}", record.profile_id),
                    cancel,
                )
            })
            .collect()
    });

    tally(records.len(), outcomes)
}

/// Fetch stats once, generate and persist one overall meta report, then one
/// guide per top civilization. Guide failures are independent: they neither
/// block each other nor disturb the overall report already written.
pub fn run_meta_report(
    source: &dyn StatsSource,
    writer: &IdempotentWriter,
    model: &dyn ChatModel,
    opts: &ReportRunOptions,
    cancel: &CancelFlag,
) -> Result<RunSummary> {
    let payload = source
        .civilization_stats(&opts.leaderboard, None)
        .context("civilization stats fetch failed")?;
    if payload.data.is_empty() {
        return Err(anyhow!(
            "stats fetch returned zero civilizations for {}",
            opts.leaderboard
        ));
    }

    let ctx = SnapshotContext::new(&opts.leaderboard, None, &payload.patch);
    let bucket = ctx.time_bucket();
    let records: Vec<CivilizationStat> = payload
        .data
        .iter()
        .map(|raw| build_civ_stat(raw, &ctx))
        .collect();
    let (top, bottom) = select_extremes(&records, opts.extremes);
    log::info!(
        "generating meta report from {} civilizations, patch {} (model {})",
        records.len(),
        ctx.patch,
        model.model_name()
    );

    let mut outcomes = Vec::with_capacity(1 + opts.guide_count);

    if cancel.is_cancelled() {
        outcomes.push(PersistOutcome::Skipped);
    } else {
        let prompt = build_meta_prompt(&top, &bottom, &ctx.patch);
        match generate_report(model, META_SYSTEM_ROLE, &prompt, opts.max_retries) {
            Ok(sections) => {
                let report = overall_report(sections, &ctx, &opts.map_type);
                let key =
                    idempotency_key(&opts.table, &report.entity_key(), &report.patch, &bucket);
                outcomes.push(persist_record(
                    writer,
                    &opts.table,
                    &report.fields(),
                    &key,
                    "overall meta report",
                    cancel,
                ));
            }
            Err(err) => {
                log::warn!("overall meta report skipped: {err}");
                outcomes.push(PersistOutcome::Failed);
            }
        }
    }

    for (idx, stat) in top.iter().take(opts.guide_count).enumerate() {
        if cancel.is_cancelled() {
            outcomes.push(PersistOutcome::Skipped);
            continue;
        }
        let prompt = build_civ_guide_prompt(stat, idx + 1, records.len());
        match generate_report(model, GUIDE_SYSTEM_ROLE, &prompt, opts.max_retries) {
            Ok(sections) => {
                let report = guide_report(sections, stat, &opts.map_type);
                let key =
                    idempotency_key(&opts.table, &report.entity_key(), &report.patch, &bucket);
                outcomes.push(persist_record(
                    writer,
                    &opts.table,
                    &report.fields(),
                    &key,
                    &format!("guide for {}", stat.civilization),
                    cancel,
                ));
            }
            Err(err) => {
                log::warn!("guide for {} skipped: {err}", stat.civilization);
                outcomes.push(PersistOutcome::Failed);
            }
        }
    }

    tally(records.len(), outcomes)
}

/// Top-k and bottom-k by win rate. The sort is stable, so entries with equal
/// win rates keep their original API order. `top` is descending, `bottom`
/// ascending, matching the prompt template.
pub fn select_extremes(
    records: &[CivilizationStat],
    k: usize,
) -> (Vec<CivilizationStat>, Vec<CivilizationStat>) {
    let mut sorted: Vec<&CivilizationStat> = records.iter().collect();
    sorted.sort_by(|a, b| b.win_rate.partial_cmp(&a.win_rate).unwrap_or(Ordering::Equal));

    let top = sorted.iter().take(k).map(|s| (*s).clone()).collect();
    let tail_start = sorted.len().saturating_sub(k);
    let mut bottom: Vec<CivilizationStat> =
        sorted[tail_start..].iter().map(|s| (*s).clone()).collect();
    bottom.reverse();
    (top, bottom)
}

fn overall_report(sections: ReportSections, ctx: &SnapshotContext, map_type: &str) -> MetaReport {
    MetaReport {
        title: format!("Current Meta Analysis - Patch {}", ctx.patch),
        civilization: "All".to_string(),
        matchup_vs: "Meta Overview".to_string(),
        map_type: map_type.to_string(),
        early_game: sections.early_game,
        mid_game: sections.mid_game,
        late_game: sections.late_game,
        key_units: sections.key_units,
        key_technologies: sections.key_technologies,
        ai_confidence: sections.confidence,
        ai_reasoning: sections.reasoning,
        patch: ctx.patch.clone(),
    }
}

fn guide_report(sections: ReportSections, stat: &CivilizationStat, map_type: &str) -> MetaReport {
    MetaReport {
        title: format!("{} - Current Meta Guide (Top Tier)", stat.civilization),
        civilization: stat.civilization.clone(),
        matchup_vs: "Current Meta".to_string(),
        map_type: map_type.to_string(),
        early_game: sections.early_game,
        mid_game: sections.mid_game,
        late_game: sections.late_game,
        key_units: sections.key_units,
        key_technologies: sections.key_technologies,
        ai_confidence: sections.confidence,
        ai_reasoning: sections.reasoning,
        patch: stat.patch.clone(),
    }
}

fn persist_record(
    writer: &IdempotentWriter,
    table: &str,
    fields: &serde_json::Value,
    key: &str,
    label: &str,
    cancel: &CancelFlag,
) -> PersistOutcome {
    if cancel.is_cancelled() {
        return PersistOutcome::Skipped;
    }
    match writer.create(table, fields, key) {
        Ok(WriteOutcome::Created) => PersistOutcome::Persisted,
        Ok(WriteOutcome::Duplicate) => {
            log::info!("duplicate snapshot suppressed for {label}");
            PersistOutcome::Duplicate
        }
        Err(err) if err.is_fatal_for_run() => {
            cancel.cancel();
            PersistOutcome::Fatal(format!("{label}: {err}"))
        }
        Err(err) => {
            log::warn!("persist failed for {label}: {err}");
            PersistOutcome::Failed
        }
    }
}

fn tally(fetched: usize, outcomes: Vec<PersistOutcome>) -> Result<RunSummary> {
    let mut summary = RunSummary {
        fetched,
        ..Default::default()
    };
    let mut fatal = None;
    for outcome in outcomes {
        match outcome {
            PersistOutcome::Persisted => summary.persisted += 1,
            PersistOutcome::Duplicate | PersistOutcome::Skipped => summary.skipped += 1,
            PersistOutcome::Failed => summary.failed += 1,
            PersistOutcome::Fatal(msg) => {
                summary.failed += 1;
                fatal = Some(msg);
            }
        }
    }
    if let Some(msg) = fatal {
        log::error!("run aborted ({summary})");
        return Err(anyhow!("fatal store error: {msg}"));
    }
    log::info!("run complete ({summary})");
    Ok(summary)
}

fn with_persist_pool<T>(threads: usize, action: impl FnOnce() -> T + Send) -> T
where
    T: Send,
{
    let threads = threads.clamp(1, 16);
    match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
        Ok(pool) => pool.install(action),
        Err(_) => action(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(id: &str, win: f64) -> CivilizationStat {
        CivilizationStat {
            civ_id: id.to_string(),
            civilization: id.to_string(),
            leaderboard: "rm_solo".to_string(),
            rank_level: "All Ranks".to_string(),
            win_rate: win,
            pick_rate: 5.0,
            games_count: 100,
            avg_game_duration: 1700,
            patch: "12.1".to_string(),
            last_updated: "2026-08-06T14:00:00+00:00".to_string(),
        }
    }

    #[test]
    fn extremes_over_ten_entries_are_disjoint_and_cover_everything() {
        let records: Vec<_> = (0..10)
            .map(|i| stat(&format!("civ{i}"), 60.0 - i as f64))
            .collect();
        let (top, bottom) = select_extremes(&records, 5);
        assert_eq!(top.len(), 5);
        assert_eq!(bottom.len(), 5);

        let mut ids: Vec<&str> = top
            .iter()
            .chain(bottom.iter())
            .map(|s| s.civ_id.as_str())
            .collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn top_is_descending_and_bottom_ascending() {
        let records = vec![
            stat("mid", 50.0),
            stat("best", 58.0),
            stat("worst", 42.0),
            stat("good", 55.0),
            stat("bad", 45.0),
        ];
        let (top, bottom) = select_extremes(&records, 2);
        assert_eq!(top[0].civ_id, "best");
        assert_eq!(top[1].civ_id, "good");
        assert_eq!(bottom[0].civ_id, "worst");
        assert_eq!(bottom[1].civ_id, "bad");
    }

    #[test]
    fn ties_keep_original_api_order_in_top() {
        let records = vec![stat("first", 50.0), stat("second", 50.0), stat("third", 48.0)];
        let (top, _) = select_extremes(&records, 2);
        assert_eq!(top[0].civ_id, "first");
        assert_eq!(top[1].civ_id, "second");
    }

    #[test]
    fn short_lists_overlap_rather_than_pad() {
        let records = vec![stat("a", 50.0), stat("b", 49.0), stat("c", 48.0)];
        let (top, bottom) = select_extremes(&records, 5);
        assert_eq!(top.len(), 3);
        assert_eq!(bottom.len(), 3);
    }

    #[test]
    fn cancel_flag_propagates_to_clones() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_cancelled());
        flag.cancel();
        assert!(clone.is_cancelled());
    }
}
