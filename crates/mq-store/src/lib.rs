//! Store Gateway (C2): a thin wrapper over the columnar analytical store.
//!
//! Talks to the store's native HTTP interface (grounded on
//! `original_source/scripts/clickhouse.py`, which opens a
//! `clickhouse_connect` client and issues `SET allow_experimental_lightweight_delete=1`
//! once per connection). Over HTTP the store has no persistent session, so
//! that setting is instead attached as a query parameter on every request
//! that needs it, which is functionally equivalent.
//!
//! Callers never see a driver type: `Describe`/`Insert`/`Query`/`Exec` are
//! the full surface.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::env;

/// Result of a `Query` call: ordered column names plus rows aligned to them.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone)]
pub struct StoreGateway {
    client: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl StoreGateway {
    /// Connect using `HOST`, `USERNAME_DB`, `PASSWORD`, matching
    /// `DataCoreClient.connect_to_db` in `original_source/scripts/receive.py`.
    pub fn connect_from_env() -> Result<Self> {
        let host = env::var("HOST").context("HOST does not exist")?;
        let username = env::var("USERNAME_DB").context("USERNAME_DB does not exist")?;
        let password = env::var("PASSWORD").context("PASSWORD does not exist")?;
        Self::new(&host, &username, &password)
    }

    pub fn new(host: &str, username: &str, password: &str) -> Result<Self> {
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.to_string()
        } else {
            format!("http://{host}:8123")
        };
        let client = reqwest::Client::builder()
            .build()
            .context("failed to build store HTTP client")?;
        Ok(Self {
            client,
            base_url,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    fn request(&self, query: &str, lightweight_delete: bool) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .post(&self.base_url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[("query", query)]);
        if lightweight_delete {
            req = req.query(&[("allow_experimental_lightweight_delete", "1")]);
        }
        req
    }

    /// `Describe(database, table) -> [column_name]`, the ordered set defining
    /// the table schema (includes the store-generated `uuid` column; callers
    /// that need the augmented-column contract subtract it themselves).
    pub async fn describe(&self, database: &str, table: &str) -> Result<Vec<String>> {
        let sql = format!("DESCRIBE TABLE {database}.{table} FORMAT JSONEachRow");
        let resp = self
            .request(&sql, false)
            .send()
            .await
            .with_context(|| format!("describe {database}.{table} failed"))?;
        let body = response_text(resp, &sql).await?;
        let mut columns = Vec::new();
        for line in body.lines().filter(|l| !l.trim().is_empty()) {
            let row: Value = serde_json::from_str(line)
                .with_context(|| format!("describe {database}.{table}: malformed row {line}"))?;
            let name = row
                .get("name")
                .and_then(Value::as_str)
                .with_context(|| format!("describe {database}.{table}: row missing name: {line}"))?;
            columns.push(name.to_string());
        }
        Ok(columns)
    }

    /// `Insert(database, table, columns, rows, async=true)`. Blocks locally
    /// until the store has accepted the batch; a failure is retriable by the
    /// caller.
    pub async fn insert(
        &self,
        database: &str,
        table: &str,
        columns: &[String],
        rows: &[Vec<Value>],
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let col_list = columns.join(", ");
        let sql = format!("INSERT INTO {database}.{table} ({col_list}) FORMAT JSONEachRow");

        let mut body = String::new();
        for row in rows {
            if row.len() != columns.len() {
                bail!(
                    "insert into {database}.{table}: row has {} values, expected {} columns",
                    row.len(),
                    columns.len()
                );
            }
            let mut obj = serde_json::Map::with_capacity(columns.len());
            for (col, val) in columns.iter().zip(row.iter()) {
                obj.insert(col.clone(), val.clone());
            }
            body.push_str(&serde_json::to_string(&Value::Object(obj))?);
            body.push('\n');
        }

        let resp = self
            .client
            .post(&self.base_url)
            .basic_auth(&self.username, Some(&self.password))
            .query(&[
                ("query", sql.as_str()),
                ("wait_end_of_query", "1"),
                ("async_insert", "1"),
                ("wait_for_async_insert", "1"),
            ])
            .body(body)
            .send()
            .await
            .with_context(|| format!("insert into {database}.{table} failed"))?;
        response_text(resp, &sql).await?;
        Ok(())
    }

    /// `Query(sql) -> {column_names, rows}`.
    pub async fn query(&self, sql: &str) -> Result<QueryResult> {
        let tagged = format!("{sql} FORMAT JSONCompact");
        let resp = self
            .request(&tagged, true)
            .send()
            .await
            .with_context(|| format!("query failed: {sql}"))?;
        let body = response_text(resp, &tagged).await?;
        let parsed: Value =
            serde_json::from_str(&body).with_context(|| format!("query returned non-JSON body: {sql}"))?;

        let columns: Vec<String> = parsed
            .get("meta")
            .and_then(Value::as_array)
            .map(|meta| {
                meta.iter()
                    .filter_map(|m| m.get("name").and_then(Value::as_str).map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let rows: Vec<Vec<Value>> = parsed
            .get("data")
            .and_then(Value::as_array)
            .map(|data| {
                data.iter()
                    .map(|row| row.as_array().cloned().unwrap_or_default())
                    .collect()
            })
            .unwrap_or_default();

        Ok(QueryResult { columns, rows })
    }

    /// `Exec(sql)` — for `ALTER`/`DELETE` with lightweight-delete semantics enabled.
    pub async fn exec(&self, sql: &str) -> Result<()> {
        let resp = self
            .request(sql, true)
            .send()
            .await
            .with_context(|| format!("exec failed: {sql}"))?;
        response_text(resp, sql).await?;
        Ok(())
    }
}

async fn response_text(resp: reqwest::Response, sql: &str) -> Result<String> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .with_context(|| format!("failed reading response body for: {sql}"))?;
    if !status.is_success() {
        bail!("store returned {status} for `{sql}`: {text}");
    }
    Ok(text)
}
