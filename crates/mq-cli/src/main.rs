mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use commands::{rollup_stats, run_consumer};

#[derive(Parser)]
#[command(name = "mq-cli")]
#[command(about = "Report ingestion consumer CLI", long_about = None)]
struct Cli {
    /// Directory for daily-rotating log files, in addition to stdout.
    /// Falls back to the `LOG_DIR` environment variable.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the Scheduler main loop until SIGINT/SIGTERM.
    RunConsumer {
        #[arg(long, default_value = "config/queues.json")]
        queues_config: PathBuf,

        #[arg(long, default_value = "config/reports.json")]
        reports_config: PathBuf,

        #[arg(long, default_value = "config/transformers.json")]
        transformers_config: PathBuf,

        #[arg(long, default_value = "errors")]
        errors_dir: PathBuf,

        #[arg(long, default_value = "logging/processed_messages.sqlite3")]
        stats_db: PathBuf,

        #[arg(long, default_value_t = mq_ingest::scheduler::DEFAULT_PARALLELISM)]
        parallelism: usize,

        #[arg(long, default_value_t = mq_ingest::scheduler::DEFAULT_SWEEP_INTERVAL_SECS)]
        sweep_interval_secs: u64,
    },

    /// Emit the daily rollup notification for whatever stats are currently
    /// accumulated, then clear them.
    RollupStats {
        #[arg(long, default_value = "logging/processed_messages.sqlite3")]
        stats_db: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();
    let log_dir = cli.log_dir.clone().or_else(|| std::env::var("LOG_DIR").ok().map(PathBuf::from));
    let _log_guard = init_tracing(log_dir.as_deref());

    match cli.cmd {
        Commands::RunConsumer {
            queues_config,
            reports_config,
            transformers_config,
            errors_dir,
            stats_db,
            parallelism,
            sweep_interval_secs,
        } => {
            run_consumer::run(run_consumer::RunConsumerArgs {
                queues_config,
                reports_config,
                transformers_config,
                errors_dir,
                stats_db,
                parallelism,
                sweep_interval_secs,
            })
            .await
        }
        Commands::RollupStats { stats_db } => {
            rollup_stats::run(rollup_stats::RollupStatsArgs { stats_db }).await
        }
    }
}

/// stdout logging plus, when a log directory is configured, a daily-rotating
/// file layer (carried forward from the original system's
/// `RotatingFileHandler`). The returned guard must stay alive for the
/// process lifetime or the non-blocking file writer stops flushing.
fn init_tracing(log_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let stdout_layer = tracing_subscriber::fmt::layer();

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mq-ingest.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false);
            tracing_subscriber::registry()
                .with(env_filter)
                .with(stdout_layer)
                .with(file_layer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(env_filter).with(stdout_layer).init();
            None
        }
    }
}
