//! Dead-letter Sink (C9): on unrecoverable per-message failure, writes the
//! original envelope to disk and inserts an audit row.
//!
//! The audit record is a single flat row with no hash-chaining (see
//! DESIGN.md). Kept is the append-only, `OpenOptions`-based file write
//! idiom and the `anyhow::Context` error style.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde_json::{Map, Value};
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use mq_store::StoreGateway;

/// Audit Record: one row per message outcome.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub database: String,
    pub table: String,
    pub queue: String,
    pub key_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub is_success: bool,
    pub message_json_truncated: String,
}

pub const AUDIT_TABLE: &str = "rmq_log";
pub const AUDIT_DATABASE: &str = "DataCore";

/// At most the first 100 elements of `data` are retained,
/// matching `tables.py::DataCoreClient.insert_message`.
pub const MAX_AUDIT_DATA_ROWS: usize = 100;

/// Build the truncated envelope JSON stored in an [`AuditEntry`].
pub fn truncate_envelope(report: &str, key_id: Option<&str>, data: &[Map<String, Value>]) -> String {
    let truncated: Vec<&Map<String, Value>> = data.iter().take(MAX_AUDIT_DATA_ROWS).collect();
    let body = serde_json::json!({
        "header": { "report": report, "key_id": key_id },
        "data": truncated,
    });
    serde_json::to_string(&body).unwrap_or_default()
}

pub struct AuditSink {
    errors_dir: PathBuf,
}

impl AuditSink {
    pub fn new(errors_dir: impl Into<PathBuf>) -> Self {
        Self {
            errors_dir: errors_dir.into(),
        }
    }

    /// `errors/<utc-timestamp>_<table-or-unknown>.json`, written with
    /// exclusive-lock-protected atomic write (write-temp, lock, write,
    /// rename) so concurrent Workers never interleave JSON on a shared
    /// volume.
    pub fn write_dead_letter(&self, table_or_unknown: &str, envelope_json: &str) -> Result<PathBuf> {
        fs::create_dir_all(&self.errors_dir)
            .with_context(|| format!("create errors dir {}", self.errors_dir.display()))?;

        let ts = Utc::now().format("%Y-%m-%dT%H%M%S%.6fZ");
        let filename = format!("{ts}_{table_or_unknown}.json");
        let final_path = self.errors_dir.join(&filename);
        let tmp_path = self.errors_dir.join(format!("{filename}.tmp"));

        let mut file = File::create(&tmp_path)
            .with_context(|| format!("create {}", tmp_path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("lock {}", tmp_path.display()))?;
        file.write_all(envelope_json.as_bytes())
            .with_context(|| format!("write {}", tmp_path.display()))?;
        file.sync_all().ok();
        FileExt::unlock(&file).ok();
        drop(file);

        fs::rename(&tmp_path, &final_path)
            .with_context(|| format!("rename {} -> {}", tmp_path.display(), final_path.display()))?;
        Ok(final_path)
    }

    /// Insert one or more audit rows via a single `Insert` call. The Worker
    /// accumulates `AuditEntry` values in its `pending_audit` buffer and
    /// flushes them here at the same cadence as the data-row insert, rather
    /// than issuing one round trip per message.
    pub async fn insert_audit_rows(&self, store: &StoreGateway, entries: &[AuditEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let columns = vec![
            "database".to_string(),
            "table".to_string(),
            "queue".to_string(),
            "key_id".to_string(),
            "datetime".to_string(),
            "is_success".to_string(),
            "message".to_string(),
        ];
        let rows: Vec<Vec<Value>> = entries
            .iter()
            .map(|entry| {
                vec![
                    Value::String(entry.database.clone()),
                    Value::String(entry.table.clone()),
                    Value::String(entry.queue.clone()),
                    entry
                        .key_id
                        .clone()
                        .map(Value::String)
                        .unwrap_or(Value::Null),
                    Value::String(entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string()),
                    Value::Bool(entry.is_success),
                    Value::String(entry.message_json_truncated.clone()),
                ]
            })
            .collect();
        store
            .insert(AUDIT_DATABASE, AUDIT_TABLE, &columns, &rows)
            .await
            .context("insert audit rows failed")
    }

    /// Retention: delete audit rows older than 7 days.
    pub async fn delete_expired(&self, store: &StoreGateway) -> Result<()> {
        let sql = format!(
            "ALTER TABLE {AUDIT_DATABASE}.{AUDIT_TABLE} DELETE WHERE toDate(datetime) <= today() - 7"
        );
        store.exec(&sql).await.context("audit retention delete failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_envelope_caps_data_at_100_rows() {
        let data: Vec<Map<String, Value>> = (0..150)
            .map(|i| {
                let mut m = Map::new();
                m.insert("i".to_string(), Value::Number(i.into()));
                m
            })
            .collect();
        let json = truncate_envelope("R", Some("K9"), &data);
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["data"].as_array().unwrap().len(), MAX_AUDIT_DATA_ROWS);
        assert_eq!(parsed["header"]["report"], "R");
        assert_eq!(parsed["header"]["key_id"], "K9");
    }

    #[test]
    fn truncate_envelope_below_cap_keeps_all_rows() {
        let data: Vec<Map<String, Value>> = (0..3)
            .map(|i| {
                let mut m = Map::new();
                m.insert("i".to_string(), Value::Number(i.into()));
                m
            })
            .collect();
        let json = truncate_envelope("R", None, &data);
        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["data"].as_array().unwrap().len(), 3);
        assert!(parsed["header"]["key_id"].is_null());
    }

    #[test]
    fn write_dead_letter_creates_file_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path());
        let path = sink.write_dead_letter("unknown", "{\"data\":[]}").unwrap();
        assert!(path.exists());
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "{\"data\":[]}");
    }

    #[test]
    fn write_dead_letter_filenames_are_distinguishable_per_table() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::new(dir.path());
        let a = sink.write_dead_letter("orders_report", "{}").unwrap();
        let b = sink.write_dead_letter("unknown", "{}").unwrap();
        assert!(a.file_name().unwrap().to_string_lossy().contains("orders_report"));
        assert!(b.file_name().unwrap().to_string_lossy().contains("unknown"));
    }
}
