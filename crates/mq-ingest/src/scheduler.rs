//! Scheduler (C7): bounded-parallelism sweeps across configured queues.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::future::join_all;
use lapin::Connection;
use tokio::sync::Semaphore;

use mq_audit::AuditSink;
use mq_broker::BrokerGateway;
use mq_config::Registry as ConfigRegistry;
use mq_notify::Notifier;
use mq_stats::{parse_day_boundary, DayBoundaryLatch, StatsStore, ROLLOVER_DEBOUNCE_SECS};
use mq_store::StoreGateway;
use mq_transform::Registry as TransformRegistry;

use crate::worker::{drain_queue, WorkerOutcome};

/// Default parallelism P and sweep interval T.
pub const DEFAULT_PARALLELISM: usize = 10;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

pub struct SchedulerConfig {
    pub parallelism: usize,
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

pub struct Scheduler {
    connection: Connection,
    exchange: String,
    config: ConfigRegistry,
    transformers: TransformRegistry,
    store: StoreGateway,
    audit: Arc<AuditSink>,
    stats: Arc<StatsStore>,
    notifier: Arc<Notifier>,
    quarantine: Arc<Mutex<HashSet<String>>>,
    scheduler_config: SchedulerConfig,
    latch: DayBoundaryLatch,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        connection: Connection,
        exchange: String,
        config: ConfigRegistry,
        transformers: TransformRegistry,
        store: StoreGateway,
        audit: AuditSink,
        stats: StatsStore,
        notifier: Notifier,
        scheduler_config: SchedulerConfig,
    ) -> Self {
        Self {
            connection,
            exchange,
            config,
            transformers,
            store,
            audit: Arc::new(audit),
            stats: Arc::new(stats),
            notifier: Arc::new(notifier),
            quarantine: Arc::new(Mutex::new(HashSet::new())),
            scheduler_config,
            latch: DayBoundaryLatch::new(),
        }
    }

    /// Declare and bind every configured queue once at startup.
    pub async fn declare_all(&self) -> Result<()> {
        let gateway = BrokerGateway::open_channel(&self.connection, self.exchange.clone())
            .await
            .context("open declare channel")?;
        for (queue, routing_key) in &self.config.queues {
            gateway
                .declare_and_bind(queue, routing_key)
                .await
                .with_context(|| format!("declare/bind {queue}"))?;
        }
        Ok(())
    }

    /// Run the Scheduler loop until `shutdown` resolves (SIGINT/SIGTERM),
    /// letting in-flight Workers finish their current drain before exiting.
    pub async fn run_until(&self, mut shutdown: tokio::sync::oneshot::Receiver<()>) -> Result<()> {
        loop {
            self.sweep().await?;
            self.maybe_roll_over().await;

            tokio::select! {
                _ = tokio::time::sleep(self.scheduler_config.sweep_interval) => {}
                _ = &mut shutdown => {
                    tracing::info!("scheduler received shutdown signal, exiting after in-flight drains");
                    return Ok(());
                }
            }

            if shutdown.try_recv().is_ok() {
                return Ok(());
            }
        }
    }

    /// One sweep: schedule a Worker for every queue not currently
    /// quarantined, gated by a semaphore of size P.
    async fn sweep(&self) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(self.scheduler_config.parallelism.max(1)));
        let quarantined: HashSet<String> = self.quarantine.lock().unwrap().clone();
        let batch_size = self.config.batch_size;

        let mut handles = Vec::new();
        for queue in self.config.queues.keys() {
            if quarantined.contains(queue) {
                continue;
            }
            let queue = queue.clone();
            let semaphore = Arc::clone(&semaphore);
            let connection = &self.connection;
            let exchange = self.exchange.clone();
            let store = self.store.clone();
            let transformers = &self.transformers;
            let audit = Arc::clone(&self.audit);
            let quarantine = Arc::clone(&self.quarantine);
            let notifier = Arc::clone(&self.notifier);
            let stats = Arc::clone(&self.stats);

            let handle = async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                let gateway = match BrokerGateway::open_channel(connection, exchange).await {
                    Ok(g) => g,
                    Err(e) => {
                        tracing::warn!(queue, error = %e, "failed to open worker channel, skipping this sweep");
                        return;
                    }
                };
                let outcome = drain_queue(&gateway, &store, transformers, &audit, &queue, batch_size, &quarantine).await;
                report_outcome(&queue, outcome, &stats, &notifier).await;
            };
            handles.push(handle);
        }

        join_all(handles).await;
        Ok(())
    }

    /// Day-boundary rollup check, run once per sweep on the Scheduler's own
    /// latch.
    async fn maybe_roll_over(&self) {
        let boundary = match parse_day_boundary(&self.config.day_boundary) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!(error = %e, "invalid day_boundary, skipping rollup check");
                return;
            }
        };
        let now = Utc::now().with_timezone(&self.config.timezone);
        if !self.latch.should_roll_over(now, boundary) {
            return;
        }

        let rows = match self.stats.load_all() {
            Ok(map) => map
                .into_iter()
                .map(|(q, r)| (q, r.running_message_count, r.last_processed_table))
                .collect::<Vec<_>>(),
            Err(e) => {
                tracing::error!(error = %e, "failed to load stats for daily rollup");
                return;
            }
        };
        let host = std::env::var("HOST_HOSTNAME").unwrap_or_else(|_| "unknown-host".to_string());
        let message = mq_notify::format_daily_rollup(&rows, &host);

        match self.notifier.send_telegram(&message).await {
            Ok(()) => {
                if let Err(e) = self.stats.clear() {
                    tracing::error!(error = %e, "failed to clear stats after rollup");
                }
                tokio::time::sleep(Duration::from_secs(ROLLOVER_DEBOUNCE_SECS)).await;
            }
            Err(e) => tracing::error!(error = %e, "daily rollup notification failed"),
        }
    }
}

async fn report_outcome(queue: &str, outcome: WorkerOutcome, stats: &StatsStore, notifier: &Notifier) {
    match outcome {
        WorkerOutcome::Done { tables, processed } => {
            if processed > 0 {
                let now = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();
                let table = tables.last().cloned().unwrap_or_default();
                if let Err(e) = stats.bump(queue, processed as i64, &table, &now) {
                    tracing::error!(queue, error = %e, "failed to bump stats");
                }
            }
        }
        WorkerOutcome::Quarantined { table_or_unknown, key_id, reason } => {
            tracing::warn!(queue, table_or_unknown, reason, "queue quarantined");
            let key_ids = key_id.into_iter().collect::<Vec<_>>();
            let message = mq_notify::format_quarantine_alert(queue, &table_or_unknown, &key_ids);
            if let Err(e) = notifier.send_telegram(&message).await {
                tracing::error!(queue, error = %e, "failed to send quarantine alert");
            }
        }
        WorkerOutcome::Aborted { error } => {
            tracing::warn!(queue, error, "drain aborted by transient error, queue not quarantined");
        }
    }
}
