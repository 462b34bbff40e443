//! Consumer-group reader over one Redis stream.

use crate::{
    DATA_FIELD, DEFAULT_CONSUMER, DEFAULT_GROUP, DEFAULT_STREAM, ERROR_FIELD,
    default_dead_letter_stream,
};
use distribution_projector_core::stream::truncate_error;
use distribution_projector_core::{ReadCursor, StreamConsumer, StreamError, StreamMessage};
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisError};
use std::fmt;
use std::time::Duration;

/// Redis URL used when none is configured.
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379/0";

/// Names of the streams and group a consumer works with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamConfig {
    /// Stream carrying the envelopes.
    pub stream: String,
    /// Consumer group.
    pub group: String,
    /// This consumer's name within the group.
    pub consumer: String,
    /// Stream receiving `{data, error}` for unprocessable entries.
    pub dead_letter_stream: String,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            stream: DEFAULT_STREAM.to_owned(),
            group: DEFAULT_GROUP.to_owned(),
            consumer: DEFAULT_CONSUMER.to_owned(),
            dead_letter_stream: default_dead_letter_stream(DEFAULT_STREAM),
        }
    }
}

/// Open a managed connection to `redis_url`.
///
/// The connection manager reconnects on its own after transport failures.
pub(crate) async fn open(redis_url: &str) -> Result<ConnectionManager, StreamError> {
    let client = Client::open(redis_url)
        .map_err(|e| StreamError::Connection(format!("Failed to create Redis client: {e}")))?;
    ConnectionManager::new(client).await.map_err(|e| {
        StreamError::Connection(format!("Failed to create Redis connection manager: {e}"))
    })
}

/// [`StreamConsumer`] over Redis Streams.
///
/// The consumer group is created lazily on the first read, at stream id `0`
/// with `MKSTREAM`; a group that already exists (`BUSYGROUP`) is fine.
///
/// # Example
///
/// ```no_run
/// use distribution_projector_redis::RedisStreamConsumer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let consumer = RedisStreamConsumer::builder()
///     .redis_url("redis://127.0.0.1:6379/0")
///     .stream("distribucion.bloques")
///     .group("grp.distribucion")
///     .consumer("ms-distribucion-2")
///     .connect()
///     .await?;
/// assert_eq!(consumer.config().dead_letter_stream, "distribucion.bloques.dlq");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisStreamConsumer {
    conn: ConnectionManager,
    config: StreamConfig,
    group_ready: bool,
}

impl fmt::Debug for RedisStreamConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStreamConsumer")
            .field("config", &self.config)
            .field("group_ready", &self.group_ready)
            .finish_non_exhaustive()
    }
}

impl RedisStreamConsumer {
    /// Builder with the default stream, group and consumer names.
    #[must_use]
    pub fn builder() -> RedisStreamConsumerBuilder {
        RedisStreamConsumerBuilder::default()
    }

    /// Stream, group and consumer names in use.
    #[must_use]
    pub const fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// A handle on the same connection.
    #[must_use]
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn ensure_group(&mut self) -> Result<(), StreamError> {
        if self.group_ready {
            return Ok(());
        }
        let created: Result<(), RedisError> = self
            .conn
            .xgroup_create_mkstream(&self.config.stream, &self.config.group, "0")
            .await;
        match created {
            Ok(()) => tracing::info!(
                stream = %self.config.stream,
                group = %self.config.group,
                "Consumer group created"
            ),
            Err(e) if e.code() == Some("BUSYGROUP") => tracing::debug!(
                stream = %self.config.stream,
                group = %self.config.group,
                "Consumer group already exists"
            ),
            Err(e) => {
                return Err(StreamError::ConsumerGroup(format!(
                    "Failed to create group {} on {}: {e}",
                    self.config.group, self.config.stream
                )));
            }
        }
        self.group_ready = true;
        Ok(())
    }
}

impl StreamConsumer for RedisStreamConsumer {
    async fn read(
        &mut self,
        cursor: ReadCursor,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        self.ensure_group().await?;

        let mut options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(max_count);
        if cursor == ReadCursor::New {
            options = options.block(block_millis(block));
        }

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.config.stream], &[cursor.as_stream_id()], &options)
            .await
            .map_err(|e| {
                // The stream was deleted under us: recreate the group next time.
                if e.code() == Some("NOGROUP") {
                    self.group_ready = false;
                }
                StreamError::Read(e.to_string())
            })?;

        let messages: Vec<StreamMessage> = reply
            .map(|reply| {
                reply
                    .keys
                    .into_iter()
                    .flat_map(|key| key.ids)
                    .map(into_message)
                    .collect()
            })
            .unwrap_or_default();

        if !messages.is_empty() {
            tracing::debug!(
                stream = %self.config.stream,
                cursor = %cursor,
                count = messages.len(),
                "Read batch"
            );
        }
        Ok(messages)
    }

    async fn acknowledge(&mut self, message_id: &str) -> Result<(), StreamError> {
        let _: i64 = self
            .conn
            .xack(&self.config.stream, &self.config.group, &[message_id])
            .await
            .map_err(|e| StreamError::Acknowledge {
                id: message_id.to_owned(),
                reason: e.to_string(),
            })?;
        tracing::trace!(id = message_id, "Acknowledged");
        Ok(())
    }

    async fn dead_letter(&mut self, raw_payload: &str, error: &str) -> Result<(), StreamError> {
        let error = truncate_error(error);
        let entry_id: String = self
            .conn
            .xadd(
                &self.config.dead_letter_stream,
                "*",
                &[(DATA_FIELD, raw_payload), (ERROR_FIELD, error.as_str())],
            )
            .await
            .map_err(|e| StreamError::DeadLetter(e.to_string()))?;

        tracing::warn!(
            dead_letter_stream = %self.config.dead_letter_stream,
            entry_id = %entry_id,
            error = %error,
            "Message dead-lettered"
        );
        Ok(())
    }
}

fn into_message(entry: StreamId) -> StreamMessage {
    let payload = entry.get::<String>(DATA_FIELD);
    StreamMessage::new(entry.id, payload)
}

/// `BLOCK` argument in milliseconds; at least 1, since `0` blocks forever.
fn block_millis(block: Duration) -> usize {
    usize::try_from(block.as_millis())
        .unwrap_or(usize::MAX)
        .max(1)
}

/// Builder for [`RedisStreamConsumer`].
///
/// Unset names fall back to [`StreamConfig::default`]; an unset dead-letter
/// stream follows the (possibly customized) stream name.
#[derive(Clone, Debug, Default)]
pub struct RedisStreamConsumerBuilder {
    redis_url: Option<String>,
    stream: Option<String>,
    group: Option<String>,
    consumer: Option<String>,
    dead_letter_stream: Option<String>,
}

impl RedisStreamConsumerBuilder {
    /// Redis URL. Default: [`DEFAULT_REDIS_URL`].
    #[must_use]
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Stream carrying the envelopes.
    #[must_use]
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = Some(stream.into());
        self
    }

    /// Consumer group.
    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Consumer name within the group.
    #[must_use]
    pub fn consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    /// Dead-letter stream. Default: `<stream>.dlq`.
    #[must_use]
    pub fn dead_letter_stream(mut self, stream: impl Into<String>) -> Self {
        self.dead_letter_stream = Some(stream.into());
        self
    }

    /// The names this builder resolves to.
    #[must_use]
    pub fn config(&self) -> StreamConfig {
        let defaults = StreamConfig::default();
        let stream = self.stream.clone().unwrap_or(defaults.stream);
        StreamConfig {
            dead_letter_stream: self
                .dead_letter_stream
                .clone()
                .unwrap_or_else(|| default_dead_letter_stream(&stream)),
            stream,
            group: self.group.clone().unwrap_or(defaults.group),
            consumer: self.consumer.clone().unwrap_or(defaults.consumer),
        }
    }

    /// Connect and build the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Connection`] if the URL is invalid or Redis is
    /// unreachable.
    pub async fn connect(self) -> Result<RedisStreamConsumer, StreamError> {
        let url = self.redis_url.as_deref().unwrap_or(DEFAULT_REDIS_URL);
        let conn = open(url).await?;
        let consumer = self.with_connection(conn);
        tracing::info!(
            stream = %consumer.config.stream,
            group = %consumer.config.group,
            consumer = %consumer.config.consumer,
            dead_letter_stream = %consumer.config.dead_letter_stream,
            "RedisStreamConsumer created successfully"
        );
        Ok(consumer)
    }

    /// Build the consumer over an existing connection.
    #[must_use]
    pub fn with_connection(self, conn: ConnectionManager) -> RedisStreamConsumer {
        RedisStreamConsumer {
            conn,
            config: self.config(),
            group_ready: false,
        }
    }
}
