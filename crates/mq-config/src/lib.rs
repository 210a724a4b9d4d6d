//! Config Registry (C1).
//!
//! Loads the queue -> routing-key bindings and the report-name -> table
//! bindings from JSON files, plus the handful of env-driven constants the
//! rest of the pipeline treats as process-wide and read-only after startup.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

/// `queue_name -> routing_key` bindings, all bound to one durable direct exchange.
pub type QueueRoutingMap = HashMap<String, String>;

/// `report_name -> table_name` bindings. Keys are the human-language report
/// names carried in `header.report`; values are snake_case destination tables.
pub type ReportTableMap = HashMap<String, String>;

/// Default batch size `B` for the Sign-Collapse Writer.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// Default day-boundary wall-clock time.
pub const DEFAULT_DAY_BOUNDARY: &str = "19:58";

/// Default timezone for the day-boundary comparison.
pub const DEFAULT_TIMEZONE: &str = "Europe/Moscow";

#[derive(Debug, Clone)]
pub struct Registry {
    pub queues: QueueRoutingMap,
    pub reports: ReportTableMap,
    pub batch_size: usize,
    pub day_boundary: String,
    pub timezone: chrono_tz::Tz,
}

impl Registry {
    /// Load the two JSON mappings from disk and layer env-driven constants on top.
    ///
    /// `queues_path`/`reports_path` are JSON objects (`{"NAME": "value", ...}`).
    /// Missing required environment variables are fatal, matching the
    /// source's `MissingEnvironmentVariable` behavior.
    pub fn load(queues_path: &Path, reports_path: &Path) -> Result<Self> {
        let queues = load_string_map(queues_path)?;
        let reports = load_string_map(reports_path)?;

        let batch_size = match env::var("BATCH_SIZE") {
            Ok(v) => v
                .parse::<usize>()
                .with_context(|| format!("BATCH_SIZE is not a valid integer: {v}"))?,
            Err(_) => DEFAULT_BATCH_SIZE,
        };

        let day_boundary = env::var("DAY_BOUNDARY").unwrap_or_else(|_| DEFAULT_DAY_BOUNDARY.to_string());

        let tz_name = env::var("TIMEZONE").unwrap_or_else(|_| DEFAULT_TIMEZONE.to_string());
        let timezone: chrono_tz::Tz = tz_name
            .parse()
            .with_context(|| format!("unrecognized TIMEZONE value: {tz_name}"))?;

        Ok(Self {
            queues,
            reports,
            batch_size,
            day_boundary,
            timezone,
        })
    }

    pub fn routing_key(&self, queue: &str) -> Option<&str> {
        self.queues.get(queue).map(String::as_str)
    }

    pub fn table_for_report(&self, report: &str) -> Option<&str> {
        self.reports.get(report).map(String::as_str)
    }
}

fn load_string_map(path: &Path) -> Result<HashMap<String, String>> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config: {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parse json: {}", path.display()))?;
    let obj = match value {
        serde_json::Value::Object(map) => map,
        other => bail!("{} must contain a JSON object, got {other}", path.display()),
    };
    let mut out = HashMap::with_capacity(obj.len());
    for (k, v) in obj {
        let s = v
            .as_str()
            .with_context(|| format!("{}: value for key {k} is not a string", path.display()))?;
        out.insert(k, s.to_string());
    }
    Ok(out)
}

/// Read a required environment variable, matching the source's
/// `get_my_env_var` fatal-on-absence behavior.
pub fn get_env_var(name: &str) -> Result<String> {
    env::var(name).with_context(|| format!("{name} does not exist"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_json(dir: &tempfile::TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_queue_and_report_maps() {
        let dir = tempfile::tempdir().unwrap();
        let queues = write_json(&dir, "queues.json", r#"{"Q1":"Q1_RT"}"#);
        let reports = write_json(&dir, "reports.json", r#"{"ReportA":"report_a"}"#);

        let reg = Registry::load(&queues, &reports).unwrap();
        assert_eq!(reg.routing_key("Q1"), Some("Q1_RT"));
        assert_eq!(reg.table_for_report("ReportA"), Some("report_a"));
        assert_eq!(reg.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(reg.day_boundary, DEFAULT_DAY_BOUNDARY);
    }

    #[test]
    fn rejects_non_object_json() {
        let dir = tempfile::tempdir().unwrap();
        let queues = write_json(&dir, "queues.json", "[1,2,3]");
        let reports = write_json(&dir, "reports.json", "{}");
        assert!(Registry::load(&queues, &reports).is_err());
    }

    #[test]
    fn unknown_queue_and_report_return_none() {
        let dir = tempfile::tempdir().unwrap();
        let queues = write_json(&dir, "queues.json", "{}");
        let reports = write_json(&dir, "reports.json", "{}");
        let reg = Registry::load(&queues, &reports).unwrap();
        assert_eq!(reg.routing_key("missing"), None);
        assert_eq!(reg.table_for_report("missing"), None);
    }
}
