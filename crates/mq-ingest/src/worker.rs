//! Queue Worker (C6): drain-one-queue state machine.

use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;
use chrono::Utc;
use mq_audit::{AuditEntry, AuditSink};
use mq_broker::Broker;
use mq_store::StoreGateway;
use mq_transform::{Registry as TransformRegistry, Transformer};
use serde_json::Value;

use crate::envelope::parse_envelope;
use crate::writer::{self, PendingBuffers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Draining,
    Quarantining,
    Done,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Idle => "IDLE",
            WorkerState::Draining => "DRAINING",
            WorkerState::Quarantining => "QUARANTINING",
            WorkerState::Done => "DONE",
        }
    }
}

/// Outcome of one drain, returned to the Scheduler.
#[derive(Debug)]
pub enum WorkerOutcome {
    Done {
        tables: Vec<String>,
        processed: usize,
    },
    Quarantined {
        table_or_unknown: String,
        key_id: Option<String>,
        reason: String,
    },
    Aborted {
        error: String,
    },
}

/// Worker-local buffer for exactly one active report family at a time. A
/// drain that mixes report families within one queue flushes the prior
/// family's buffer before starting a new one, so `AckMultiple` is never
/// called across messages whose rows haven't all been inserted yet.
struct ActiveBuffer {
    report_name: String,
    buffers: PendingBuffers,
}

/// Drain queue `Q` to completion: `Idle -> Draining -> {Done | Quarantining -> Done} | Aborted`.
#[allow(clippy::too_many_arguments)]
pub async fn drain_queue(
    broker: &dyn Broker,
    store: &StoreGateway,
    transformers: &TransformRegistry,
    audit: &AuditSink,
    queue: &str,
    batch_size: usize,
    quarantine: &Mutex<HashSet<String>>,
) -> WorkerOutcome {
    let mut active: Option<ActiveBuffer> = None;
    let mut flushed_tables = Vec::new();
    let mut processed = 0usize;
    let mut state = WorkerState::Draining;
    tracing::debug!(queue, state = WorkerState::Idle.as_str(), next = state.as_str(), "worker starting drain");

    loop {
        let delivery = match broker.get_one(queue).await {
            Ok(d) => d,
            Err(e) => return WorkerOutcome::Aborted { error: e.to_string() },
        };

        let Some(delivery) = delivery else {
            if let Some(mut active) = active.take() {
                let transformer = transformers
                    .get(&active.report_name)
                    .expect("transformer for an already-buffered report must still be registered");
                match flush_and_ack(broker, store, audit, transformer, &mut active.buffers).await {
                    Ok(count) => {
                        processed += count;
                        flushed_tables.push(transformer.table_name().to_string());
                    }
                    Err(e) => return WorkerOutcome::Aborted { error: e.to_string() },
                }
            }
            state = WorkerState::Done;
            tracing::debug!(queue, state = state.as_str(), processed, "worker drain complete");
            return WorkerOutcome::Done { tables: flushed_tables, processed };
        };

        let envelope = match parse_envelope(&delivery.body) {
            Ok(e) => e,
            Err(e) => {
                return quarantine_message(
                    broker,
                    store,
                    audit,
                    quarantine,
                    queue,
                    delivery.delivery_tag,
                    "unknown",
                    "(undecodable)",
                    None,
                    &[],
                    e.to_string(),
                )
                .await;
            }
        };

        let Some(transformer) = transformers.get(&envelope.report) else {
            return quarantine_message(
                broker,
                store,
                audit,
                quarantine,
                queue,
                delivery.delivery_tag,
                "unknown",
                &envelope.report,
                envelope.key_id.as_deref(),
                &envelope.data,
                format!("no transformer registered for report `{}`", envelope.report),
            )
            .await;
        };

        if envelope.is_truncate && envelope.data.is_empty() {
            // Flush any buffered appends first: they were delivered before
            // this truncate message and must land (then be wiped) rather
            // than be silently reordered to after the delete.
            if let Some(mut prior) = active.take() {
                let prior_transformer = transformers
                    .get(&prior.report_name)
                    .expect("transformer for an already-buffered report must still be registered");
                match flush_and_ack(broker, store, audit, prior_transformer, &mut prior.buffers).await {
                    Ok(count) => {
                        processed += count;
                        flushed_tables.push(prior_transformer.table_name().to_string());
                    }
                    Err(e) => return WorkerOutcome::Aborted { error: e.to_string() },
                }
            }

            match truncate_table(store, transformer).await {
                Ok(()) => {
                    let entry = AuditEntry {
                        database: transformer.database_name().to_string(),
                        table: transformer.table_name().to_string(),
                        queue: queue.to_string(),
                        key_id: None,
                        timestamp: Utc::now(),
                        is_success: true,
                        message_json_truncated: mq_audit::truncate_envelope(&envelope.report, None, &[]),
                    };
                    // Truncate executes its own delete immediately, so there
                    // is no later data-insert cadence to piggyback on — this
                    // one entry is its own batch.
                    if let Err(e) = audit.insert_audit_rows(store, std::slice::from_ref(&entry)).await {
                        return WorkerOutcome::Aborted { error: e.to_string() };
                    }
                    if let Err(e) = broker.ack_multiple(delivery.delivery_tag).await {
                        return WorkerOutcome::Aborted { error: e.to_string() };
                    }
                    processed += 1;
                    flushed_tables.push(transformer.table_name().to_string());
                    continue;
                }
                Err(e) => return WorkerOutcome::Aborted { error: e.to_string() },
            }
        }

        if active.as_ref().is_some_and(|a| a.report_name != envelope.report) {
            let mut prior = active.take().unwrap();
            let prior_transformer = transformers
                .get(&prior.report_name)
                .expect("transformer for an already-buffered report must still be registered");
            match flush_and_ack(broker, store, audit, prior_transformer, &mut prior.buffers).await {
                Ok(count) => {
                    processed += count;
                    flushed_tables.push(prior_transformer.table_name().to_string());
                }
                Err(e) => return WorkerOutcome::Aborted { error: e.to_string() },
            }
        }

        let parsed_on = format!(
            "{}_{}.json",
            transformer.table_name(),
            Utc::now().format("%Y%m%dT%H%M%S%.f")
        );
        let transformed: Vec<serde_json::Map<String, Value>> = envelope
            .data
            .iter()
            .cloned()
            .map(|record| transformer.transform(record, &parsed_on))
            .collect();

        if let Some(first) = transformed.first() {
            match column_set_mismatch(store, transformer, first).await {
                Ok(None) => {}
                Ok(Some(reason)) => {
                    return quarantine_message(
                        broker,
                        store,
                        audit,
                        quarantine,
                        queue,
                        delivery.delivery_tag,
                        transformer.table_name(),
                        &envelope.report,
                        envelope.key_id.as_deref(),
                        &envelope.data,
                        reason,
                    )
                    .await;
                }
                Err(e) => return WorkerOutcome::Aborted { error: e.to_string() },
            }
        }

        {
            let buffers = &mut active
                .get_or_insert_with(|| ActiveBuffer {
                    report_name: envelope.report.clone(),
                    buffers: PendingBuffers::default(),
                })
                .buffers;
            let business_key = envelope.key_id.clone().unwrap_or_default();
            for row in transformed {
                buffers.push(business_key.clone(), row, delivery.delivery_tag);
            }
            buffers.push_audit(AuditEntry {
                database: transformer.database_name().to_string(),
                table: transformer.table_name().to_string(),
                queue: queue.to_string(),
                key_id: envelope.key_id.clone(),
                timestamp: Utc::now(),
                is_success: true,
                message_json_truncated: mq_audit::truncate_envelope(
                    &envelope.report,
                    envelope.key_id.as_deref(),
                    &envelope.data,
                ),
            });
        }

        let threshold_reached = active
            .as_ref()
            .is_some_and(|a| a.buffers.pending_rows.len() >= batch_size);
        if threshold_reached {
            let mut taken = active.take().unwrap();
            match flush_and_ack(broker, store, audit, transformer, &mut taken.buffers).await {
                Ok(count) => {
                    processed += count;
                    flushed_tables.push(transformer.table_name().to_string());
                }
                Err(e) => return WorkerOutcome::Aborted { error: e.to_string() },
            }
        }
    }
}

async fn flush_and_ack(
    broker: &dyn Broker,
    store: &StoreGateway,
    audit: &AuditSink,
    transformer: &dyn Transformer,
    buffers: &mut PendingBuffers,
) -> Result<usize> {
    let tag = buffers.latest_delivery_tag();
    let count = writer::flush(store, audit, transformer, buffers).await?;
    if let Some(tag) = tag {
        broker.ack_multiple(tag).await?;
    }
    Ok(count)
}

async fn truncate_table(store: &StoreGateway, transformer: &dyn Transformer) -> Result<()> {
    let sql = format!(
        "ALTER TABLE {}.{} DELETE WHERE {} IS NOT NULL",
        transformer.database_name(),
        transformer.table_name(),
        transformer.business_key_column()
    );
    store.exec(&sql).await
}

/// `db_columns := Describe(table) - {uuid}`; `msg_columns := keys(data[0])`.
/// Returns `Some(reason)` when the symmetric difference is non-empty.
async fn column_set_mismatch(
    store: &StoreGateway,
    transformer: &dyn Transformer,
    first_row: &serde_json::Map<String, Value>,
) -> Result<Option<String>> {
    let db_columns: HashSet<String> = store
        .describe(transformer.database_name(), transformer.table_name())
        .await?
        .into_iter()
        .filter(|c| c != "uuid")
        .collect();
    let msg_columns: HashSet<String> = first_row.keys().cloned().collect();

    let missing_in_db: Vec<&String> = msg_columns.difference(&db_columns).collect();
    let missing_in_msg: Vec<&String> = db_columns.difference(&msg_columns).collect();
    if missing_in_db.is_empty() && missing_in_msg.is_empty() {
        Ok(None)
    } else {
        Ok(Some(format!(
            "column set mismatch for {}: message has extra {:?}, table has extra {:?}",
            transformer.table_name(),
            missing_in_db,
            missing_in_msg
        )))
    }
}

#[allow(clippy::too_many_arguments)]
async fn quarantine_message(
    broker: &dyn Broker,
    store: &StoreGateway,
    audit: &AuditSink,
    quarantine: &Mutex<HashSet<String>>,
    queue: &str,
    delivery_tag: u64,
    table_or_unknown: &str,
    report: &str,
    key_id: Option<&str>,
    data: &[serde_json::Map<String, Value>],
    reason: String,
) -> WorkerOutcome {
    let envelope_json = mq_audit::truncate_envelope(report, key_id, data);

    if let Err(e) = audit.write_dead_letter(table_or_unknown, &envelope_json) {
        return WorkerOutcome::Aborted { error: e.to_string() };
    }

    let entry = AuditEntry {
        database: "DataCore".to_string(),
        table: table_or_unknown.to_string(),
        queue: queue.to_string(),
        key_id: key_id.map(str::to_string),
        timestamp: Utc::now(),
        is_success: false,
        message_json_truncated: envelope_json,
    };
    // Quarantine is terminal with no later insert to batch against, so this
    // one entry is flushed as its own single-row batch.
    if let Err(e) = audit.insert_audit_rows(store, std::slice::from_ref(&entry)).await {
        return WorkerOutcome::Aborted { error: e.to_string() };
    }

    if let Err(e) = broker.nack(delivery_tag, true).await {
        return WorkerOutcome::Aborted { error: e.to_string() };
    }

    quarantine.lock().unwrap().insert(queue.to_string());

    tracing::warn!(
        queue,
        state = WorkerState::Quarantining.as_str(),
        next = WorkerState::Done.as_str(),
        table_or_unknown,
        reason,
        "worker quarantined queue"
    );

    WorkerOutcome::Quarantined {
        table_or_unknown: table_or_unknown.to_string(),
        key_id: key_id.map(str::to_string),
        reason,
    }
}
