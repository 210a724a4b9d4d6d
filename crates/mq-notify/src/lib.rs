//! Chat/mail notifier: daily rollup alerts and quarantine alerts.
//!
//! Telegram path grounded on `original_source/scripts/send2telegram.py`
//! (`GET https://api.telegram.org/bot{TOKEN}/sendMessage`, `chat_id =
//! "<CHAT_ID>/<TOPIC>"`, HTML `<blockquote expandable>` body,
//! `reply_to_message_id`). The mail path (`EMAIL_USER`/`EMAIL_PASSWORD`/
//! `RECIPIENT_EMAIL`) is read and validated at startup but its send is a
//! logged no-op: no SMTP contract is specified, and no SMTP crate appears
//! anywhere in the retrieval pack to ground one on.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Up to 3 attempts, 30s/60s/120s backoff between them.
const BACKOFF: [Duration; 2] = [Duration::from_secs(30), Duration::from_secs(60)];
const MAX_ATTEMPTS: usize = 3;

/// Chat/mail alert is truncated to this many characters before sending.
pub const MESSAGE_CHAR_LIMIT: usize = 4090;

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub token: String,
    pub chat_id: String,
    pub topic: String,
    pub reply_to_message_id: String,
    pub host_hostname: String,
}

impl TelegramConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            token: env::var("TOKEN_TELEGRAM").context("TOKEN_TELEGRAM does not exist")?,
            chat_id: env::var("CHAT_ID").context("CHAT_ID does not exist")?,
            topic: env::var("TOPIC").context("TOPIC does not exist")?,
            reply_to_message_id: env::var("MESSAGE_ID").context("MESSAGE_ID does not exist")?,
            host_hostname: env::var("HOST_HOSTNAME").context("HOST_HOSTNAME does not exist")?,
        })
    }
}

/// Read-and-validate only; the mail path itself never actually sends.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub email_user: String,
    pub email_password: String,
    pub recipient_email: String,
}

impl MailConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            email_user: env::var("EMAIL_USER").context("EMAIL_USER does not exist")?,
            email_password: env::var("EMAIL_PASSWORD").context("EMAIL_PASSWORD does not exist")?,
            recipient_email: env::var("RECIPIENT_EMAIL").context("RECIPIENT_EMAIL does not exist")?,
        })
    }
}

pub struct Notifier {
    client: reqwest::Client,
    telegram: TelegramConfig,
    api_base: String,
}

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

impl Notifier {
    pub fn new(telegram: TelegramConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            telegram,
            api_base: TELEGRAM_API_BASE.to_string(),
        }
    }

    /// Used by tests to point at a mock server instead of the real API.
    fn with_api_base(telegram: TelegramConfig, api_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            telegram,
            api_base,
        }
    }

    /// Send `message` to the configured Telegram chat, retrying up to
    /// `MAX_ATTEMPTS` times with the fixed backoff schedule. Failures are
    /// logged and returned to the caller, who must never let a notifier
    /// failure abort ingestion.
    pub async fn send_telegram(&self, message: &str) -> Result<()> {
        let truncated = truncate_message(message);
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.telegram.token);
        let chat_id = format!("{}/{}", self.telegram.chat_id, self.telegram.topic);
        let body = format!("<blockquote expandable>{truncated}</blockquote>");

        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let result = self
                .client
                .get(&url)
                .query(&[
                    ("chat_id", chat_id.as_str()),
                    ("text", body.as_str()),
                    ("parse_mode", "HTML"),
                    ("reply_to_message_id", self.telegram.reply_to_message_id.as_str()),
                ])
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match result {
                Ok(_) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "telegram send failed");
                    last_err = Some(e);
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(BACKOFF[attempt - 1]).await;
                    }
                }
            }
        }
        Err(anyhow::anyhow!(
            "telegram send failed after {MAX_ATTEMPTS} attempts: {:?}",
            last_err
        ))
    }

    /// Logged no-op (see module docs).
    pub fn send_mail(&self, mail: &MailConfig, message: &str) {
        tracing::info!(
            recipient = %mail.recipient_email,
            len = message.len(),
            "mail notifier invoked but not wired to an SMTP client; logging only"
        );
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() <= MESSAGE_CHAR_LIMIT {
        message.to_string()
    } else {
        message.chars().take(MESSAGE_CHAR_LIMIT).collect()
    }
}

/// Render the daily rollup summary from per-queue stats,
/// matching `send2telegram.py::handle_message`'s per-queue block format.
pub fn format_daily_rollup(rows: &[(String, i64, String)], host_hostname: &str) -> String {
    if rows.is_empty() {
        return format!(
            "Статистика обработки сообщений за день с RabbitMQ на сервере {host_hostname}:\nНе было сообщений"
        );
    }
    let mut total = 0i64;
    let mut blocks = Vec::with_capacity(rows.len());
    for (queue, count, table) in rows {
        total += count;
        blocks.push(format!(
            "Очередь: `{queue}`\nОбработанная таблица: \n`{table}`\nКоличество сообщений: {count}\n"
        ));
    }
    let mut message = blocks.join("\n");
    message.push_str(&format!("\nОбщее количество строк: {total}"));
    format!("Статистика обработки сообщений за день с RabbitMQ на сервере {host_hostname}:\n{message}")
}

/// Render a quarantine alert.
pub fn format_quarantine_alert(queue: &str, table: &str, key_ids: &[String]) -> String {
    let joined = key_ids.join(", ");
    format!(
        "Очередь `{queue}` помещена в карантин.\nТаблица: `{table}`\nОшибок: {}\nkey_id: {joined}",
        key_ids.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_daily_rollup_empty_rows_reports_no_messages() {
        let msg = format_daily_rollup(&[], "host1");
        assert!(msg.contains("Не было сообщений"));
        assert!(msg.contains("host1"));
    }

    #[test]
    fn format_daily_rollup_sums_total_across_queues() {
        let rows = vec![
            ("Q1".to_string(), 3, "orders_report".to_string()),
            ("Q2".to_string(), 5, "freight_rates".to_string()),
        ];
        let msg = format_daily_rollup(&rows, "host1");
        assert!(msg.contains("Общее количество строк: 8"));
        assert!(msg.contains("Q1"));
        assert!(msg.contains("Q2"));
    }

    #[test]
    fn format_quarantine_alert_lists_key_ids_and_count() {
        let msg = format_quarantine_alert("Q1", "orders_report", &["K1".to_string(), "K2".to_string()]);
        assert!(msg.contains("Ошибок: 2"));
        assert!(msg.contains("K1, K2"));
    }

    #[test]
    fn truncate_message_caps_at_char_limit() {
        let long = "x".repeat(MESSAGE_CHAR_LIMIT + 50);
        let truncated = truncate_message(&long);
        assert_eq!(truncated.chars().count(), MESSAGE_CHAR_LIMIT);
    }

    #[test]
    fn truncate_message_below_limit_is_unchanged() {
        let short = "hello";
        assert_eq!(truncate_message(short), "hello");
    }

    fn test_telegram_config() -> TelegramConfig {
        TelegramConfig {
            token: "T".to_string(),
            chat_id: "C".to_string(),
            topic: "TOP".to_string(),
            reply_to_message_id: "1".to_string(),
            host_hostname: "host1".to_string(),
        }
    }

    #[tokio::test]
    async fn send_telegram_succeeds_on_2xx() {
        let server = httpmock::MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET)
                .path("/botT/sendMessage")
                .query_param("chat_id", "C/TOP");
            then.status(200);
        });

        let notifier = Notifier::with_api_base(test_telegram_config(), server.base_url());
        notifier.send_telegram("hello").await.unwrap();
        mock.assert();
    }

    #[tokio::test(start_paused = true)]
    async fn send_telegram_retries_then_fails_after_max_attempts() {
        let server = httpmock::MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(httpmock::Method::GET);
            then.status(500);
        });

        let notifier = Notifier::with_api_base(test_telegram_config(), server.base_url());
        let err = notifier.send_telegram("hello").await.unwrap_err();
        assert!(err.to_string().contains("3 attempts"));
        assert_eq!(mock.hits(), MAX_ATTEMPTS);
    }
}
