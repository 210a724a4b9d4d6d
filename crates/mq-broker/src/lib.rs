//! Broker Gateway (C3): AMQP 0-9-1 operations over a single logical channel.
//!
//! One [`BrokerGateway`] wraps exactly one [`lapin::Channel`] and is owned
//! exclusively by one Queue Worker for the duration of a drain. `GetOne` is
//! a synchronous pull (`basic_get`), not a subscription callback, matching
//! `original_source/scripts/rabbit_mq.py::RabbitMQ.get`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, ExchangeKind};
use std::env;
use std::time::Duration;

/// Connection tuning matching `original_source/scripts/rabbit_mq.py::connect`:
/// `heartbeat=600`, `connection_attempts=5`, `retry_delay=3s`. The source's
/// `blocked_connection_timeout=300s` is a pika-specific client-side watchdog
/// with no equivalent `lapin` knob and is not reproduced here.
pub const HEARTBEAT_SECS: u16 = 600;
pub const CONNECTION_ATTEMPTS: usize = 5;
pub const RETRY_DELAY: Duration = Duration::from_secs(3);

/// One message pulled via `GetOne`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
}

/// Broker-shaped capability set the Queue Worker (C6) actually needs,
/// extracted so tests can substitute an in-memory fake instead of a live
/// AMQP connection (mirrors the object-safe provider boundary pattern used
/// elsewhere for market-data providers).
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_one(&self, queue: &str) -> Result<Option<Delivery>>;
    async fn depth(&self, queue: &str) -> Result<u32>;
    async fn ack_multiple(&self, delivery_tag: u64) -> Result<()>;
    async fn nack(&self, delivery_tag: u64, multiple: bool) -> Result<()>;
}

pub struct BrokerGateway {
    channel: Channel,
    exchange: String,
}

#[async_trait]
impl Broker for BrokerGateway {
    async fn get_one(&self, queue: &str) -> Result<Option<Delivery>> {
        BrokerGateway::get_one(self, queue).await
    }

    async fn depth(&self, queue: &str) -> Result<u32> {
        BrokerGateway::depth(self, queue).await
    }

    async fn ack_multiple(&self, delivery_tag: u64) -> Result<()> {
        BrokerGateway::ack_multiple(self, delivery_tag).await
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        BrokerGateway::nack(self, delivery_tag, multiple).await
    }
}

impl BrokerGateway {
    /// Connect using `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_USER`,
    /// `RABBITMQ_PASSWORD`, `EXCHANGE_NAME`, retrying up to
    /// `CONNECTION_ATTEMPTS` times with `RETRY_DELAY` between attempts.
    ///
    /// Returns the owning [`Connection`] alongside the gateway so the caller
    /// controls its lifetime (a Worker closes it when its drain ends).
    pub async fn connect_from_env() -> Result<(Connection, Self)> {
        let host = env::var("RABBITMQ_HOST").context("RABBITMQ_HOST does not exist")?;
        let port = env::var("RABBITMQ_PORT").context("RABBITMQ_PORT does not exist")?;
        let user = env::var("RABBITMQ_USER").context("RABBITMQ_USER does not exist")?;
        let password = env::var("RABBITMQ_PASSWORD").context("RABBITMQ_PASSWORD does not exist")?;
        let exchange = env::var("EXCHANGE_NAME").context("EXCHANGE_NAME does not exist")?;

        let uri = format!(
            "amqp://{user}:{password}@{host}:{port}/%2f?heartbeat={HEARTBEAT_SECS}&channel_max=0"
        );
        Self::connect(&uri, exchange).await
    }

    pub async fn connect(uri: &str, exchange: String) -> Result<(Connection, Self)> {
        let mut last_err = None;
        for attempt in 1..=CONNECTION_ATTEMPTS {
            match Connection::connect(uri, ConnectionProperties::default()).await {
                Ok(connection) => {
                    let gateway = Self::open_channel(&connection, exchange).await?;
                    return Ok((connection, gateway));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "AMQP connection attempt failed");
                    last_err = Some(e);
                    if attempt < CONNECTION_ATTEMPTS {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(anyhow::anyhow!(
            "failed to connect to broker after {CONNECTION_ATTEMPTS} attempts: {:?}",
            last_err
        ))
    }

    /// Open a fresh channel on an already-established connection, with
    /// prefetch=1 set. Each Queue Worker calls this once per drain so it
    /// owns its channel exclusively for the drain's lifetime.
    pub async fn open_channel(connection: &Connection, exchange: String) -> Result<Self> {
        let channel = connection
            .create_channel()
            .await
            .context("failed to open AMQP channel")?;
        channel
            .basic_qos(1, lapin::options::BasicQosOptions::default())
            .await
            .context("failed to set prefetch=1")?;
        Ok(Self { channel, exchange })
    }

    /// `DeclareAndBind(queue, routing_key)` — idempotent; durable queue,
    /// durable direct exchange bound by routing key.
    pub async fn declare_and_bind(&self, queue: &str, routing_key: &str) -> Result<()> {
        self.channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("declare exchange {}", self.exchange))?;

        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("declare queue {queue}"))?;

        self.channel
            .queue_bind(
                queue,
                &self.exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("bind queue {queue} to {routing_key}"))?;

        Ok(())
    }

    /// `GetOne(queue) -> (delivery_tag, header, body) | Empty`.
    pub async fn get_one(&self, queue: &str) -> Result<Option<Delivery>> {
        let get = self
            .channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .with_context(|| format!("basic_get on {queue} failed"))?;
        Ok(get.map(|message| Delivery {
            delivery_tag: message.delivery_tag,
            body: message.data,
        }))
    }

    /// `Depth(queue) -> int`, the message count visible to this channel.
    pub async fn depth(&self, queue: &str) -> Result<u32> {
        let decl = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("passive declare for depth of {queue}"))?;
        Ok(decl.message_count())
    }

    pub async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .with_context(|| format!("ack {delivery_tag} failed"))
    }

    /// `AckMultiple(tag)` — acknowledges every delivery <= `tag` on this channel.
    pub async fn ack_multiple(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: true })
            .await
            .with_context(|| format!("ack_multiple up to {delivery_tag} failed"))
    }

    pub async fn nack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple,
                    requeue: true,
                },
            )
            .await
            .with_context(|| format!("nack {delivery_tag} (multiple={multiple}) failed"))
    }
}
