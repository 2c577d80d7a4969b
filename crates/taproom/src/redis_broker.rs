//! Redis Streams broker.
//!
//! Each queue key is a stream read through a consumer group with
//! XREADGROUP COUNT 1. Rejected messages are copied to `<key>:rejected`
//! and acknowledged so they are not redelivered.

use crate::broker::{Broker, Delivery};
use crate::error::{TaproomError, TaproomResult};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, RedisResult};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stream entry field holding the message body.
const PAYLOAD_FIELD: &str = "payload";

/// Connection settings for [`RedisBroker`].
#[derive(Debug, Clone)]
pub struct RedisBrokerConfig {
    pub url: String,
    pub consumer_group: String,
    /// Unique per consumer.
    pub consumer_name: String,
}

impl RedisBrokerConfig {
    pub fn new(url: impl Into<String>, consumer_group: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            consumer_group: consumer_group.into(),
            consumer_name: format!("taproom-{}", uuid::Uuid::new_v4()),
        }
    }
}

pub struct RedisBroker {
    client: Client,
    conn: MultiplexedConnection,
    config: RedisBrokerConfig,
    groups: HashSet<String>,
}

impl RedisBroker {
    pub async fn connect(config: RedisBrokerConfig) -> TaproomResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!(
            group = %config.consumer_group,
            consumer = %config.consumer_name,
            "Connected to Redis"
        );
        Ok(Self {
            client,
            conn,
            config,
            groups: HashSet::new(),
        })
    }

    async fn ensure_consumer_group(&mut self, stream_key: &str) -> TaproomResult<()> {
        if self.groups.contains(stream_key) {
            return Ok(());
        }

        // 0 so messages published before the first read are still delivered.
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_key)
            .arg(&self.config.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut self.conn)
            .await;

        match result {
            Ok(()) => info!(
                stream = %stream_key,
                group = %self.config.consumer_group,
                "Created consumer group"
            ),
            Err(e) if e.to_string().contains("BUSYGROUP") => debug!(
                stream = %stream_key,
                group = %self.config.consumer_group,
                "Consumer group already exists"
            ),
            Err(e) => return Err(e.into()),
        }

        self.groups.insert(stream_key.to_string());
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&mut self, queue_key: &str, payload: &[u8]) -> TaproomResult<String> {
        let id: String = self
            .conn
            .xadd(queue_key, "*", &[(PAYLOAD_FIELD, payload)])
            .await?;
        debug!(stream = %queue_key, message_id = %id, "Published message");
        Ok(id)
    }

    async fn read_next(
        &mut self,
        queue_key: &str,
        block: Duration,
    ) -> TaproomResult<Option<Delivery>> {
        self.ensure_consumer_group(queue_key).await?;

        let value: redis::Value = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.config.consumer_group)
            .arg(&self.config.consumer_name)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(queue_key)
            .arg(">")
            .query_async(&mut self.conn)
            .await?;

        parse_xreadgroup_response(queue_key, value)
    }

    async fn ack(&mut self, delivery: &Delivery) -> TaproomResult<()> {
        let acked: i64 = self
            .conn
            .xack(
                &delivery.queue_key,
                &self.config.consumer_group,
                &[&delivery.id],
            )
            .await?;

        if acked == 1 {
            debug!(message_id = %delivery.id, stream = %delivery.queue_key, "Acknowledged message");
        } else {
            warn!(
                message_id = %delivery.id,
                stream = %delivery.queue_key,
                "XACK returned {}, message may not exist",
                acked
            );
        }
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery, reason: &str) -> TaproomResult<()> {
        let dead_letter = format!("{}:rejected", delivery.queue_key);
        let _: String = self
            .conn
            .xadd(
                &dead_letter,
                "*",
                &[
                    (PAYLOAD_FIELD, delivery.payload.as_slice()),
                    ("reason", reason.as_bytes()),
                    ("message_id", delivery.id.as_bytes()),
                ],
            )
            .await?;
        self.ack(delivery).await
    }

    async fn reconnect(&mut self) -> TaproomResult<()> {
        info!("Reconnecting to Redis...");
        self.conn = self.client.get_multiplexed_async_connection().await?;
        self.groups.clear();
        Ok(())
    }
}

fn protocol_error(message: impl Into<String>) -> TaproomError {
    TaproomError::Decode(message.into())
}

fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(s) => Some(String::from_utf8_lossy(s).to_string()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

/// Parse `[[stream_key, [[message_id, [field, value, ...]]]]]`.
fn parse_xreadgroup_response(
    queue_key: &str,
    value: redis::Value,
) -> TaproomResult<Option<Delivery>> {
    let streams = match value {
        redis::Value::Nil => return Ok(None),
        redis::Value::Array(streams) => streams,
        other => {
            return Err(protocol_error(format!(
                "Unexpected XREADGROUP response type: {other:?}"
            )))
        }
    };
    let Some(stream) = streams.first() else {
        return Ok(None);
    };

    let redis::Value::Array(stream) = stream else {
        return Err(protocol_error("Expected array for stream entry"));
    };
    let Some(redis::Value::Array(messages)) = stream.get(1) else {
        return Err(protocol_error("Stream entry has no message list"));
    };
    let Some(message) = messages.first() else {
        return Ok(None);
    };
    let redis::Value::Array(message) = message else {
        return Err(protocol_error("Expected array for message"));
    };

    let id = message
        .first()
        .and_then(value_to_string)
        .ok_or_else(|| protocol_error("Message entry has no id"))?;
    let fields: &[redis::Value] = match message.get(1) {
        Some(redis::Value::Array(fields)) => fields.as_slice(),
        _ => &[],
    };

    // Without a payload the entry is still delivered, empty, so it is
    // rejected and acknowledged like any other undecodable message.
    let payload = fields
        .chunks(2)
        .find(|pair| pair.first().and_then(value_to_string).as_deref() == Some(PAYLOAD_FIELD))
        .and_then(|pair| match pair.get(1) {
            Some(redis::Value::BulkString(bytes)) => Some(bytes.clone()),
            Some(redis::Value::SimpleString(s)) => Some(s.as_bytes().to_vec()),
            _ => None,
        })
        .unwrap_or_else(|| {
            warn!(message_id = %id, "Message has no {} field", PAYLOAD_FIELD);
            Vec::new()
        });

    debug!(message_id = %id, payload_len = payload.len(), "Read message from stream");

    Ok(Some(Delivery {
        id,
        queue_key: queue_key.to_string(),
        payload,
    }))
}
