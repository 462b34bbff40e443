//! In-memory consumer-group stream.
//!
//! Models one consumer of one group: entries are delivered once through
//! [`ReadCursor::New`], stay pending until acknowledged, and are re-delivered
//! through [`ReadCursor::Backlog`]. Dead-letter writes are captured.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)] // Only mutex poisoning panics

use distribution_projector_core::stream::{
    truncate_error, ReadCursor, StreamConsumer, StreamError, StreamMessage,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// An entry written to the dead-letter stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeadLetterEntry {
    /// Original raw payload.
    pub data: String,
    /// Tagged diagnostic, already truncated.
    pub error: String,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<StreamMessage>,
    delivered: usize,
    pending: Vec<StreamMessage>,
    acknowledged: Vec<String>,
    dead_letters: Vec<DeadLetterEntry>,
    next_sequence: u64,
    failing_reads: usize,
    fail_dead_letters: bool,
    fail_acknowledgements: bool,
}

/// In-memory [`StreamConsumer`].
///
/// Clones share state: hand one to the worker and keep one for publishing
/// and assertions.
///
/// # Example
///
/// ```
/// use distribution_projector_core::stream::{ReadCursor, StreamConsumer};
/// use distribution_projector_testing::InMemoryStream;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = InMemoryStream::new();
/// let id = stream.publish("{}");
///
/// let mut consumer = stream.clone();
/// let batch = consumer.read(ReadCursor::New, 10, Duration::ZERO).await?;
/// assert_eq!(batch[0].id, id);
/// assert_eq!(stream.pending_ids(), vec![id.clone()]);
///
/// consumer.acknowledge(&id).await?;
/// assert!(stream.pending_ids().is_empty());
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug, Default)]
pub struct InMemoryStream {
    state: Arc<Mutex<StreamState>>,
}

impl InMemoryStream {
    /// Empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap()
    }

    fn append(&self, payload: Option<String>) -> String {
        let mut state = self.lock();
        state.next_sequence += 1;
        let id = format!("{}-0", state.next_sequence);
        state.entries.push(StreamMessage::new(id.clone(), payload));
        id
    }

    /// Append an entry with a `data` field; returns its id.
    pub fn publish(&self, payload: impl Into<String>) -> String {
        self.append(Some(payload.into()))
    }

    /// Append an entry without a `data` field; returns its id.
    pub fn publish_without_payload(&self) -> String {
        self.append(None)
    }

    /// Ids delivered but not acknowledged, in delivery order.
    #[must_use]
    pub fn pending_ids(&self) -> Vec<String> {
        self.lock().pending.iter().map(|m| m.id.clone()).collect()
    }

    /// Ids acknowledged so far, in order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<String> {
        self.lock().acknowledged.clone()
    }

    /// Entries written to the dead-letter stream.
    #[must_use]
    pub fn dead_letters(&self) -> Vec<DeadLetterEntry> {
        self.lock().dead_letters.clone()
    }

    /// Entries never delivered.
    #[must_use]
    pub fn undelivered(&self) -> usize {
        let state = self.lock();
        state.entries.len() - state.delivered
    }

    /// Fail the next `count` reads with a transport error.
    pub fn fail_next_reads(&self, count: usize) {
        self.lock().failing_reads = count;
    }

    /// Make dead-letter writes fail (or succeed again).
    pub fn fail_dead_letters(&self, fail: bool) {
        self.lock().fail_dead_letters = fail;
    }

    /// Make acknowledgements fail (or succeed again).
    pub fn fail_acknowledgements(&self, fail: bool) {
        self.lock().fail_acknowledgements = fail;
    }

    fn take_batch(&self, cursor: ReadCursor, max_count: usize) -> Result<Vec<StreamMessage>, StreamError> {
        let mut state = self.lock();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(StreamError::Read("injected read failure".to_owned()));
        }
        match cursor {
            ReadCursor::New => {
                let start = state.delivered;
                let end = (start + max_count).min(state.entries.len());
                let batch = state.entries[start..end].to_vec();
                state.delivered = end;
                state.pending.extend(batch.iter().cloned());
                Ok(batch)
            }
            ReadCursor::Backlog => Ok(state.pending.iter().take(max_count).cloned().collect()),
        }
    }
}

impl StreamConsumer for InMemoryStream {
    async fn read(
        &mut self,
        cursor: ReadCursor,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, StreamError> {
        let batch = self.take_batch(cursor, max_count)?;
        if batch.is_empty() && cursor == ReadCursor::New && !block.is_zero() {
            tokio::time::sleep(block).await;
        }
        Ok(batch)
    }

    async fn acknowledge(&mut self, message_id: &str) -> Result<(), StreamError> {
        let mut state = self.lock();
        if state.fail_acknowledgements {
            return Err(StreamError::Acknowledge {
                id: message_id.to_owned(),
                reason: "injected acknowledge failure".to_owned(),
            });
        }
        state.pending.retain(|m| m.id != message_id);
        state.acknowledged.push(message_id.to_owned());
        Ok(())
    }

    async fn dead_letter(&mut self, raw_payload: &str, error: &str) -> Result<(), StreamError> {
        let mut state = self.lock();
        if state.fail_dead_letters {
            return Err(StreamError::DeadLetter(
                "injected dead-letter failure".to_owned(),
            ));
        }
        state.dead_letters.push(DeadLetterEntry {
            data: raw_payload.to_owned(),
            error: truncate_error(error),
        });
        Ok(())
    }
}
