use std::path::PathBuf;

use anyhow::Result;

use mq_audit::AuditSink;
use mq_broker::BrokerGateway;
use mq_config::Registry as ConfigRegistry;
use mq_ingest::scheduler::{Scheduler, SchedulerConfig};
use mq_notify::{MailConfig, Notifier, TelegramConfig};
use mq_stats::StatsStore;
use mq_store::StoreGateway;
use mq_transform::{load_descriptors, Registry as TransformRegistry};

pub struct RunConsumerArgs {
    pub queues_config: PathBuf,
    pub reports_config: PathBuf,
    pub transformers_config: PathBuf,
    pub errors_dir: PathBuf,
    pub stats_db: PathBuf,
    pub parallelism: usize,
    pub sweep_interval_secs: u64,
}

pub async fn run(args: RunConsumerArgs) -> Result<()> {
    let config = ConfigRegistry::load(&args.queues_config, &args.reports_config)?;

    let descriptors_raw = std::fs::read_to_string(&args.transformers_config)?;
    let transformers = TransformRegistry::from_descriptors(load_descriptors(&descriptors_raw)?);

    let store = StoreGateway::connect_from_env()?;
    let audit = AuditSink::new(&args.errors_dir);
    let stats = StatsStore::open(&args.stats_db)?;
    let notifier = Notifier::new(TelegramConfig::from_env()?);
    // Validated at startup even though the mail send itself is a no-op: a
    // missing/misconfigured mail env var should fail fast, not silently.
    let _mail_config = MailConfig::from_env()?;

    let exchange = mq_config::get_env_var("EXCHANGE_NAME")?;
    let (connection, _initial_channel) = BrokerGateway::connect_from_env().await?;

    let scheduler = Scheduler::new(
        connection,
        exchange,
        config,
        transformers,
        store,
        audit,
        stats,
        notifier,
        SchedulerConfig {
            parallelism: args.parallelism,
            sweep_interval: std::time::Duration::from_secs(args.sweep_interval_secs),
        },
    );

    scheduler.declare_all().await?;
    tracing::info!("mq-ingest consumer started, entering sweep loop");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    scheduler.run_until(shutdown_rx).await
}
