//! Moving dead-lettered entries back onto the primary stream.
//!
//! The dead-letter stream is the manual retry queue: once the cause of a
//! failure is fixed (a missing order arrived, a schema was published), the
//! parked envelopes are replayed. The projection is idempotent, so replaying
//! an entry that meanwhile succeeded is a no-op.

use crate::consumer::{StreamConfig, open};
use crate::{DATA_FIELD, ERROR_FIELD};
use distribution_projector_core::StreamError;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamId, StreamRangeReply};
use std::fmt;

/// One entry of the dead-letter stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterEntry {
    /// Entry id in the dead-letter stream.
    pub id: String,
    /// The original envelope JSON.
    pub data: Option<String>,
    /// Why it was dead-lettered (`<tier>:<message>`).
    pub error: Option<String>,
}

impl From<StreamId> for DeadLetterEntry {
    fn from(entry: StreamId) -> Self {
        Self {
            data: entry.get(DATA_FIELD),
            error: entry.get(ERROR_FIELD),
            id: entry.id,
        }
    }
}

/// What a replay did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Entries moved back onto the primary stream.
    pub replayed: usize,
    /// Entries deleted because they carried no `data`.
    pub discarded: usize,
}

/// Lists and replays dead-letter entries, oldest first.
///
/// # Example
///
/// ```no_run
/// use distribution_projector_redis::DeadLetterReplayer;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let mut replayer = DeadLetterReplayer::connect(
///     "redis://127.0.0.1:6379/0",
///     "distribucion.bloques",
///     "distribucion.bloques.dlq",
/// )
/// .await?;
///
/// for entry in replayer.pending(10).await? {
///     println!("{} {:?}", entry.id, entry.error);
/// }
/// let summary = replayer.replay(10).await?;
/// println!("replayed {}", summary.replayed);
/// # Ok(())
/// # }
/// ```
pub struct DeadLetterReplayer {
    conn: ConnectionManager,
    stream: String,
    dead_letter_stream: String,
}

impl fmt::Debug for DeadLetterReplayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterReplayer")
            .field("stream", &self.stream)
            .field("dead_letter_stream", &self.dead_letter_stream)
            .finish_non_exhaustive()
    }
}

impl DeadLetterReplayer {
    /// Connect to `redis_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Connection`] if Redis is unreachable.
    pub async fn connect(
        redis_url: &str,
        stream: impl Into<String>,
        dead_letter_stream: impl Into<String>,
    ) -> Result<Self, StreamError> {
        Ok(Self::new(open(redis_url).await?, stream, dead_letter_stream))
    }

    /// Replayer over an existing connection.
    #[must_use]
    pub fn new(
        conn: ConnectionManager,
        stream: impl Into<String>,
        dead_letter_stream: impl Into<String>,
    ) -> Self {
        Self {
            conn,
            stream: stream.into(),
            dead_letter_stream: dead_letter_stream.into(),
        }
    }

    /// Replayer for the streams of a consumer configuration.
    #[must_use]
    pub fn for_config(conn: ConnectionManager, config: &StreamConfig) -> Self {
        Self::new(conn, &config.stream, &config.dead_letter_stream)
    }

    /// The oldest `limit` dead-letter entries.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Replay`] if the range query fails.
    pub async fn pending(&mut self, limit: usize) -> Result<Vec<DeadLetterEntry>, StreamError> {
        let reply: StreamRangeReply = self
            .conn
            .xrange_count(&self.dead_letter_stream, "-", "+", limit)
            .await
            .map_err(|e| StreamError::Replay(format!("Failed to list dead letters: {e}")))?;
        Ok(reply.ids.into_iter().map(DeadLetterEntry::from).collect())
    }

    /// Move the oldest `limit` entries back onto the primary stream.
    ///
    /// Each entry is re-appended (under a new id) and deleted from the
    /// dead-letter stream in one `MULTI`/`EXEC`; a crash mid-replay neither
    /// loses nor duplicates an entry.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Replay`] on the first failing entry; entries
    /// before it stay replayed.
    pub async fn replay(&mut self, limit: usize) -> Result<ReplaySummary, StreamError> {
        let mut summary = ReplaySummary::default();

        for entry in self.pending(limit).await? {
            if let Some(data) = entry.data.as_deref() {
                let (new_id, _deleted): (String, i64) = redis::pipe()
                    .atomic()
                    .xadd(&self.stream, "*", &[(DATA_FIELD, data)])
                    .xdel(&self.dead_letter_stream, &[&entry.id])
                    .query_async(&mut self.conn)
                    .await
                    .map_err(|e| {
                        StreamError::Replay(format!("Failed to replay {}: {e}", entry.id))
                    })?;
                tracing::info!(
                    dead_letter_id = %entry.id,
                    new_id = %new_id,
                    stream = %self.stream,
                    "Dead letter replayed"
                );
                summary.replayed += 1;
            } else {
                let _: i64 = self
                    .conn
                    .xdel(&self.dead_letter_stream, &[&entry.id])
                    .await
                    .map_err(|e| {
                        StreamError::Replay(format!("Failed to discard {}: {e}", entry.id))
                    })?;
                tracing::warn!(dead_letter_id = %entry.id, "Dead letter without data discarded");
                summary.discarded += 1;
            }
        }

        Ok(summary)
    }
}
