//! Message stream port.
//!
//! A [`StreamConsumer`] is a pull interface over a durable stream read through
//! a consumer group: read a batch, acknowledge each entry, and park entries
//! that cannot be processed on a dead-letter stream.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Maximum length, in characters, of the `error` field of a dead-letter entry.
pub const DEAD_LETTER_ERROR_LIMIT: usize = 500;

/// Which entries a read returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to the group (`>`).
    New,
    /// Entries delivered to this consumer but not yet acknowledged (`0`).
    Backlog,
}

impl ReadCursor {
    /// Stream id passed to the read command.
    #[must_use]
    pub const fn as_stream_id(self) -> &'static str {
        match self {
            Self::New => ">",
            Self::Backlog => "0",
        }
    }
}

impl fmt::Display for ReadCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_stream_id())
    }
}

/// One stream entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMessage {
    /// Stream entry id.
    pub id: String,
    /// The `data` field (envelope JSON). `None` when the entry has no such field.
    pub payload: Option<String>,
}

impl StreamMessage {
    /// Convenience constructor.
    pub fn new(id: impl Into<String>, payload: Option<String>) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Errors reported by a stream adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// Could not connect to the stream backend.
    #[error("stream connection error: {0}")]
    Connection(String),

    /// Creating the consumer group failed (other than "already exists").
    #[error("consumer group error: {0}")]
    ConsumerGroup(String),

    /// Reading a batch failed.
    #[error("stream read error: {0}")]
    Read(String),

    /// Acknowledging an entry failed.
    #[error("failed to acknowledge {id}: {reason}")]
    Acknowledge {
        /// Entry id
        id: String,
        /// Backend diagnostic
        reason: String,
    },

    /// Appending to the dead-letter stream failed.
    #[error("dead-letter write failed: {0}")]
    DeadLetter(String),

    /// Moving dead-letter entries back failed.
    #[error("dead-letter replay failed: {0}")]
    Replay(String),
}

/// Consumer-group reader of the event stream.
pub trait StreamConsumer: Send {
    /// Read up to `max_count` entries, waiting at most `block` for new ones.
    ///
    /// Returns an empty batch on timeout. With [`ReadCursor::Backlog`] the call
    /// returns immediately.
    ///
    /// # Errors
    ///
    /// Returns error if the backend is unreachable or the group cannot be created.
    fn read(
        &mut self,
        cursor: ReadCursor,
        max_count: usize,
        block: Duration,
    ) -> impl Future<Output = Result<Vec<StreamMessage>, StreamError>> + Send;

    /// Acknowledge an entry for the group.
    ///
    /// # Errors
    ///
    /// Returns error if the acknowledgement is not recorded.
    fn acknowledge(
        &mut self,
        message_id: &str,
    ) -> impl Future<Output = Result<(), StreamError>> + Send;

    /// Append `{data: raw_payload, error}` to the dead-letter stream.
    ///
    /// Does not acknowledge the original entry. `error` is truncated with
    /// [`truncate_error`].
    ///
    /// # Errors
    ///
    /// Returns error if the entry is not written.
    fn dead_letter(
        &mut self,
        raw_payload: &str,
        error: &str,
    ) -> impl Future<Output = Result<(), StreamError>> + Send;
}

/// Cap a diagnostic at [`DEAD_LETTER_ERROR_LIMIT`] characters.
#[must_use]
pub fn truncate_error(error: &str) -> String {
    error.chars().take(DEAD_LETTER_ERROR_LIMIT).collect()
}
