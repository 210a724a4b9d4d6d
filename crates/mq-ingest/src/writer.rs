//! Sign-Collapse Writer (C5): supersede-then-dedup-then-insert flush,
//! grounded on `original_source/scripts/tables.py`'s
//! `update_status`/`handle_rows`/`insert_message`.

use anyhow::{Context, Result};
use mq_audit::{AuditEntry, AuditSink};
use mq_store::StoreGateway;
use mq_transform::{Transformer, TransformedRow, COL_SIGN};
use serde_json::Value;
use std::collections::HashMap;

/// Business keys are chunked into groups of this size for the supersede
/// SELECT, so one flush never issues an unbounded `IN (...)` clause.
pub const SUPERSEDE_CHUNK_SIZE: usize = 1000;

/// Worker-local append buffer. Never shared across Workers.
#[derive(Default)]
pub struct PendingBuffers {
    pub pending_keys: Vec<String>,
    pub pending_rows: Vec<TransformedRow>,
    pub pending_audit: Vec<AuditEntry>,
    pub delivery_tags: Vec<u64>,
}

impl PendingBuffers {
    pub fn push(&mut self, business_key: String, row: TransformedRow, delivery_tag: u64) {
        self.pending_keys.push(business_key);
        self.pending_rows.push(row);
        self.delivery_tags.push(delivery_tag);
    }

    pub fn push_audit(&mut self, entry: AuditEntry) {
        self.pending_audit.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.pending_rows.is_empty() && self.pending_audit.is_empty()
    }

    pub fn latest_delivery_tag(&self) -> Option<u64> {
        self.delivery_tags.last().copied()
    }

    fn take(&mut self) -> (Vec<String>, Vec<TransformedRow>) {
        (
            std::mem::take(&mut self.pending_keys),
            std::mem::take(&mut self.pending_rows),
        )
    }

    pub fn clear(&mut self) {
        self.pending_keys.clear();
        self.pending_rows.clear();
        self.pending_audit.clear();
        self.delivery_tags.clear();
    }
}

/// Flush step (a): emit compensating `sign=-1` rows for every currently
/// effective row sharing a business key with `pending_keys`.
pub async fn supersede(store: &StoreGateway, transformer: &dyn Transformer, pending_keys: &[String]) -> Result<usize> {
    if pending_keys.is_empty() {
        return Ok(0);
    }
    let db = transformer.database_name();
    let table = transformer.table_name();
    let key_col = transformer.business_key_column();

    let mut superseded = 0;
    let unique_keys: Vec<&String> = {
        let mut seen = std::collections::HashSet::new();
        pending_keys.iter().filter(|k| seen.insert(k.as_str())).collect()
    };

    for chunk in unique_keys.chunks(SUPERSEDE_CHUNK_SIZE) {
        let in_list = chunk.iter().map(|k| sql_quote(k)).collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT * FROM {db}.{table} WHERE uuid IN (\
                SELECT uuid FROM {db}.{table} WHERE {key_col} IN ({in_list}) GROUP BY uuid HAVING SUM(sign) > 0)"
        );
        let result = store.query(&sql).await.with_context(|| format!("supersede select for {table}"))?;
        if result.rows.is_empty() {
            continue;
        }
        let sign_idx = result
            .columns
            .iter()
            .position(|c| c == COL_SIGN)
            .with_context(|| format!("{table}: supersede select missing `{COL_SIGN}` column"))?;

        let rows: Vec<Vec<Value>> = result
            .rows
            .into_iter()
            .map(|mut row| {
                row[sign_idx] = Value::Number((-1).into());
                row
            })
            .collect();
        superseded += rows.len();
        store
            .insert(db, table, &result.columns, &rows)
            .await
            .with_context(|| format!("supersede insert for {table}"))?;
    }
    Ok(superseded)
}

/// Flush step (b): reverse-traversal dedup by business key, keeping
/// same-batch duplicates (matched by `original_file_parsed_on`) and
/// dropping stale ones.
pub fn dedup_by_business_key(
    keys: Vec<String>,
    rows: Vec<TransformedRow>,
    parsed_on_column: &str,
) -> Vec<TransformedRow> {
    let mut seen: HashMap<String, String> = HashMap::new();
    let mut accepted_rev: Vec<TransformedRow> = Vec::with_capacity(rows.len());

    for (key, row) in keys.into_iter().zip(rows.into_iter()).rev() {
        let parsed_on = row
            .get(parsed_on_column)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match seen.get(&key) {
            None => {
                seen.insert(key, parsed_on);
                accepted_rev.push(row);
            }
            Some(recorded) if *recorded == parsed_on => {
                accepted_rev.push(row);
            }
            Some(_) => {
                // older duplicate from an earlier message in this flush
            }
        }
    }
    accepted_rev.reverse();
    accepted_rev
}

/// Flush step (c): one `Insert` call with `columns` in `expected_columns()`
/// order.
pub async fn insert_deduped(
    store: &StoreGateway,
    transformer: &dyn Transformer,
    deduped: &[TransformedRow],
) -> Result<()> {
    if deduped.is_empty() {
        return Ok(());
    }
    let columns = transformer.expected_columns().to_vec();
    let rows: Vec<Vec<Value>> = deduped
        .iter()
        .map(|row| columns.iter().map(|c| row.get(c).cloned().unwrap_or(Value::Null)).collect())
        .collect();
    store
        .insert(transformer.database_name(), transformer.table_name(), &columns, &rows)
        .await
        .with_context(|| format!("insert into {}", transformer.table_name()))
}

/// Run the full flush protocol: supersede, dedup, insert, then the
/// `pending_audit` buffer accumulated alongside those rows — the Audit log
/// is "also batched, flushed at the same cadence" as the data insert, not
/// written per message. Does not ack; the caller acks only after this
/// returns `Ok`.
pub async fn flush(
    store: &StoreGateway,
    audit: &AuditSink,
    transformer: &dyn Transformer,
    buffers: &mut PendingBuffers,
) -> Result<usize> {
    if buffers.is_empty() {
        return Ok(0);
    }
    let (keys, rows) = buffers.take();
    let audit_entries = std::mem::take(&mut buffers.pending_audit);
    supersede(store, transformer, &keys).await?;
    let deduped = dedup_by_business_key(keys, rows, mq_transform::COL_ORIGINAL_FILE_PARSED_ON);
    let count = deduped.len();
    insert_deduped(store, transformer, &deduped).await?;
    audit.insert_audit_rows(store, &audit_entries).await?;
    Ok(count)
}

fn sql_quote(key: &str) -> String {
    format!("'{}'", key.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(pairs: &[(&str, Value)]) -> TransformedRow {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn dedup_keeps_same_batch_duplicates() {
        let keys = vec!["K1".to_string(), "K1".to_string()];
        let rows = vec![
            row(&[("original_file_parsed_on", json!("f1")), ("v", json!(1))]),
            row(&[("original_file_parsed_on", json!("f1")), ("v", json!(2))]),
        ];
        let out = dedup_by_business_key(keys, rows, "original_file_parsed_on");
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn dedup_drops_stale_duplicate_from_earlier_message() {
        let keys = vec!["K1".to_string(), "K1".to_string()];
        let rows = vec![
            row(&[("original_file_parsed_on", json!("f1")), ("v", json!(1))]),
            row(&[("original_file_parsed_on", json!("f2")), ("v", json!(2))]),
        ];
        let out = dedup_by_business_key(keys, rows, "original_file_parsed_on");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("v"), Some(&json!(2)));
        assert_eq!(out[0].get("original_file_parsed_on"), Some(&json!("f2")));
    }

    #[test]
    fn dedup_preserves_insertion_order_of_accepted_rows() {
        let keys = vec!["K1".to_string(), "K2".to_string(), "K3".to_string()];
        let rows = vec![
            row(&[("original_file_parsed_on", json!("f1")), ("v", json!(1))]),
            row(&[("original_file_parsed_on", json!("f1")), ("v", json!(2))]),
            row(&[("original_file_parsed_on", json!("f1")), ("v", json!(3))]),
        ];
        let out = dedup_by_business_key(keys, rows, "original_file_parsed_on");
        let values: Vec<_> = out.iter().map(|r| r.get("v").cloned().unwrap()).collect();
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    }

    #[test]
    fn pending_buffers_push_and_clear() {
        let mut buffers = PendingBuffers::default();
        assert!(buffers.is_empty());
        buffers.push("K1".to_string(), row(&[("v", json!(1))]), 7);
        assert!(!buffers.is_empty());
        assert_eq!(buffers.latest_delivery_tag(), Some(7));
        buffers.clear();
        assert!(buffers.is_empty());
        assert_eq!(buffers.latest_delivery_tag(), None);
    }
}
