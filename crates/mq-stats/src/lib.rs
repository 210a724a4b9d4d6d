//! Stats Aggregator (C8): per-queue ingestion counters persisted in an
//! embedded single-file store, plus the day-boundary rollup latch.
//!
//! Chosen store: `rusqlite` over a literal `stats(queue_name PRIMARY KEY,
//! timestamp, count, processed_table)` table (grounded on the pack member
//! `omgpointless-aspy`'s `rusqlite` + `r2d2`/`r2d2_sqlite` pooled-connection
//! pattern), over a pure KV store (`sled`, seen only in other_examples
//! manifests) because the counters are naturally tabular.

use anyhow::{Context, Result};
use chrono::{NaiveTime, TimeZone};
use r2d2_sqlite::SqliteConnectionManager;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

pub type Pool = r2d2::Pool<SqliteConnectionManager>;

#[derive(Debug, Clone, PartialEq)]
pub struct StatsRecord {
    pub last_timestamp: String,
    pub running_message_count: i64,
    pub last_processed_table: String,
}

pub struct StatsStore {
    pool: Pool,
}

impl StatsStore {
    /// Open (creating if absent) the single-file stats store at `path`,
    /// matching the source's `logging/processed_messages.*` layout.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::new(manager).with_context(|| format!("open stats store {}", path.display()))?;
        {
            let conn = pool.get().context("get pooled connection")?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS stats (
                    queue_name TEXT PRIMARY KEY,
                    timestamp TEXT NOT NULL,
                    count INTEGER NOT NULL,
                    processed_table TEXT NOT NULL
                )",
                [],
            )
            .context("create stats table")?;
        }
        Ok(Self { pool })
    }

    /// `Bump(queue, delta, table)`: idempotent over a concurrent bump in the
    /// sense that last-writer-wins on `timestamp`/`processed_table` is
    /// acceptable.
    pub fn bump(&self, queue: &str, delta: i64, table: &str, timestamp: &str) -> Result<()> {
        let conn = self.pool.get().context("get pooled connection")?;
        conn.execute(
            "INSERT INTO stats (queue_name, timestamp, count, processed_table)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(queue_name) DO UPDATE SET
               count = count + excluded.count,
               timestamp = excluded.timestamp,
               processed_table = excluded.processed_table",
            rusqlite::params![queue, timestamp, delta, table],
        )
        .context("bump stats row")?;
        Ok(())
    }

    pub fn load_all(&self) -> Result<HashMap<String, StatsRecord>> {
        let conn = self.pool.get().context("get pooled connection")?;
        let mut stmt = conn
            .prepare("SELECT queue_name, timestamp, count, processed_table FROM stats")
            .context("prepare load_all")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    StatsRecord {
                        last_timestamp: row.get(1)?,
                        running_message_count: row.get(2)?,
                        last_processed_table: row.get(3)?,
                    },
                ))
            })
            .context("query stats rows")?;
        let mut out = HashMap::new();
        for row in rows {
            let (queue, record) = row.context("read stats row")?;
            out.insert(queue, record);
        }
        Ok(out)
    }

    /// Called after a successful daily rollup emission.
    pub fn clear(&self) -> Result<()> {
        let conn = self.pool.get().context("get pooled connection")?;
        conn.execute("DELETE FROM stats", []).context("clear stats")?;
        Ok(())
    }
}

/// Process-wide day-boundary latch. Owned by the
/// Scheduler, not any one Worker.
pub struct DayBoundaryLatch {
    already_rolled_today: AtomicBool,
}

impl Default for DayBoundaryLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl DayBoundaryLatch {
    pub fn new() -> Self {
        Self {
            already_rolled_today: AtomicBool::new(false),
        }
    }

    /// Returns `true` exactly once per day the first time `now >= boundary`
    /// is observed; resets when `now < boundary` so the next boundary fires
    /// once again.
    pub fn should_roll_over<Tz: TimeZone>(&self, now: chrono::DateTime<Tz>, boundary: NaiveTime) -> bool {
        if now.time() >= boundary {
            !self.already_rolled_today.swap(true, Ordering::SeqCst)
        } else {
            self.already_rolled_today.store(false, Ordering::SeqCst);
            false
        }
    }
}

/// Parse the config's `day_boundary` string (`"19:58"`) into a [`NaiveTime`].
pub fn parse_day_boundary(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M").with_context(|| format!("invalid day-boundary time: {s}"))
}

/// Debounce applied after a successful rollup emission.
pub const ROLLOVER_DEBOUNCE_SECS: u64 = 300;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::Europe::Moscow;

    fn tmp_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("stats.sqlite3")
    }

    #[test]
    fn bump_creates_row_on_first_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::open(&tmp_path(&dir)).unwrap();
        store.bump("Q1", 3, "orders_report", "2024-05-27 10:00:00").unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all["Q1"].running_message_count, 3);
        assert_eq!(all["Q1"].last_processed_table, "orders_report");
    }

    #[test]
    fn bump_accumulates_count_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::open(&tmp_path(&dir)).unwrap();
        store.bump("Q1", 3, "orders_report", "t1").unwrap();
        store.bump("Q1", 2, "orders_report", "t2").unwrap();
        let all = store.load_all().unwrap();
        assert_eq!(all["Q1"].running_message_count, 5);
        assert_eq!(all["Q1"].last_timestamp, "t2");
    }

    #[test]
    fn clear_removes_all_rows() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::open(&tmp_path(&dir)).unwrap();
        store.bump("Q1", 1, "t", "ts").unwrap();
        store.clear().unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn day_boundary_latch_fires_once_then_resets_below_boundary() {
        let latch = DayBoundaryLatch::new();
        let boundary = parse_day_boundary("19:58").unwrap();
        let past = Moscow.with_ymd_and_hms(2024, 5, 27, 20, 0, 0).unwrap();
        let before = Moscow.with_ymd_and_hms(2024, 5, 28, 10, 0, 0).unwrap();

        assert!(latch.should_roll_over(past, boundary));
        assert!(!latch.should_roll_over(past, boundary));
        assert!(!latch.should_roll_over(before, boundary));
        assert!(latch.should_roll_over(past, boundary));
    }

    #[test]
    fn parse_day_boundary_rejects_bad_format() {
        assert!(parse_day_boundary("not-a-time").is_err());
    }
}
