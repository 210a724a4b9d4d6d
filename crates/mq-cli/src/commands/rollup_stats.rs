use std::path::PathBuf;

use anyhow::Result;

use mq_notify::{format_daily_rollup, Notifier, TelegramConfig};
use mq_stats::StatsStore;

pub struct RollupStatsArgs {
    pub stats_db: PathBuf,
}

/// One-shot emit-then-clear, for a cron fallback alongside the Scheduler's
/// own day-boundary check.
pub async fn run(args: RollupStatsArgs) -> Result<()> {
    let stats = StatsStore::open(&args.stats_db)?;
    let notifier = Notifier::new(TelegramConfig::from_env()?);
    let host_hostname = mq_config::get_env_var("HOST_HOSTNAME")?;

    let rows: Vec<(String, i64, String)> = stats
        .load_all()?
        .into_iter()
        .map(|(queue, record)| (queue, record.running_message_count, record.last_processed_table))
        .collect();

    let message = format_daily_rollup(&rows, &host_hostname);
    notifier.send_telegram(&message).await?;
    stats.clear()?;
    tracing::info!(rows = rows.len(), "daily rollup emitted and stats cleared");
    Ok(())
}
