//! The projection worker loop.
//!
//! A [`ProjectionWorker`] drives one consumer of the event stream:
//!
//! ```text
//! read batch ─▶ decode JSON ─▶ validate contract ─▶ begin tx ─▶ project ─▶ commit ─▶ ack
//!                   │                 │                            │
//!                   └── json ─────────┴── contract ────────────────┴── projection / contract / unexpected
//!                                                                         │
//!                                                              rollback, dead-letter, ack
//! ```
//!
//! Every message ends in exactly one acknowledgement. The only exception is a
//! failing transport: if the dead-letter write or the acknowledgement itself
//! fails, the error propagates and the message stays pending until the next
//! start-up sweep re-delivers it.

use crate::metrics::ProjectorMetrics;
use crate::retry::RetryPolicy;
use distribution_projector_contracts::ContractValidator;
use distribution_projector_core::environment::{Clock, SystemClock};
use distribution_projector_core::{
    BlockProjection, CloudEvent, ProjectionOutcome, ProjectorError, ReadCursor,
    ReadModelStore, ReadModelTransaction, StreamConsumer, StreamError, StreamMessage,
};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// First blocking read of a normal start.
pub const DEFAULT_FIRST_BLOCK: Duration = Duration::from_millis(1);

/// First blocking read with `--from-start`.
pub const FROM_START_FIRST_BLOCK: Duration = Duration::from_millis(1000);

/// Errors that stop the worker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The stream failed: reads exhausted their retries, or a dead-letter
    /// write or acknowledgement was not recorded.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Why a message was dead-lettered; the tag prefixes the diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeadLetterReason {
    /// The payload is not JSON.
    Json,
    /// The envelope or payload breaks its contract.
    Contract,
    /// The event cannot be applied (strict mode, unknown orders).
    Projection,
    /// Anything else, typically storage.
    Unexpected,
}

impl DeadLetterReason {
    /// Prefix of the dead-letter `error` field.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Contract => "contract",
            Self::Projection => "projection",
            Self::Unexpected => "unexpected",
        }
    }
}

impl From<&ProjectorError> for DeadLetterReason {
    fn from(error: &ProjectorError) -> Self {
        match error {
            ProjectorError::Contract(_) => Self::Contract,
            ProjectorError::Projection(_) => Self::Projection,
            ProjectorError::Repository(_) => Self::Unexpected,
        }
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// What happened to one stream message. Every outcome was acknowledged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MessageOutcome {
    /// The event was applied and committed.
    Projected {
        /// Event id
        event_id: String,
        /// Projected block
        block_id: String,
        /// Links created
        linked: u64,
        /// Orders not linked (lenient mode)
        missing: usize,
    },
    /// The event id was already processed.
    Duplicate {
        /// Event id
        event_id: String,
    },
    /// The entry had no `data` field.
    Skipped,
    /// The entry was parked on the dead-letter stream.
    DeadLettered {
        /// Failure tier
        reason: DeadLetterReason,
    },
}

impl MessageOutcome {
    /// Metric label.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Projected { .. } => "projected",
            Self::Duplicate { .. } => "duplicate",
            Self::Skipped => "skipped",
            Self::DeadLettered { .. } => "dead_lettered",
        }
    }
}

impl From<ProjectionOutcome> for MessageOutcome {
    fn from(outcome: ProjectionOutcome) -> Self {
        match outcome {
            ProjectionOutcome::Projected {
                id,
                block_id,
                linked,
                missing,
            } => Self::Projected {
                event_id: id,
                block_id,
                linked,
                missing,
            },
            ProjectionOutcome::Duplicate { id } => Self::Duplicate { event_id: id },
        }
    }
}

/// Per-outcome message counts of a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Events applied.
    pub projected: usize,
    /// Events already processed.
    pub duplicates: usize,
    /// Entries without payload.
    pub skipped: usize,
    /// Entries dead-lettered.
    pub dead_lettered: usize,
}

impl RunSummary {
    /// Count one outcome.
    pub fn record(&mut self, outcome: &MessageOutcome) {
        match outcome {
            MessageOutcome::Projected { .. } => self.projected += 1,
            MessageOutcome::Duplicate { .. } => self.duplicates += 1,
            MessageOutcome::Skipped => self.skipped += 1,
            MessageOutcome::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }

    /// Messages processed.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.projected + self.duplicates + self.skipped + self.dead_lettered
    }

    fn merge(&mut self, other: Self) {
        self.projected += other.projected;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
        self.dead_lettered += other.dead_lettered;
    }
}

/// Worker tuning.
#[derive(Clone, Debug, PartialEq)]
pub struct WorkerConfig {
    /// Maximum entries per read.
    pub batch_size: usize,
    /// How long a read waits for new entries.
    pub block: Duration,
    /// Wait of the first read for new entries, right after the backlog sweep.
    pub first_block: Duration,
    /// Backoff for failed reads.
    pub read_retry: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            block: Duration::from_millis(5000),
            first_block: DEFAULT_FIRST_BLOCK,
            read_retry: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Wait longer on the first read, so entries published while the worker
    /// was starting are picked up by it.
    #[must_use]
    pub const fn from_start(mut self) -> Self {
        self.first_block = FROM_START_FIRST_BLOCK;
        self
    }
}

/// Drives stream → validator → projection → ack/dead-letter.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
/// let mut worker = ProjectionWorker::new(
///     consumer,
///     store,
///     BlockProjection::new(ProjectionPolicy::default()),
///     Arc::new(validator),
///     WorkerConfig::default(),
///     shutdown_rx,
/// );
/// let summary = worker.run().await?;
/// ```
pub struct ProjectionWorker<S, St, C = SystemClock> {
    consumer: S,
    store: St,
    projection: BlockProjection<C>,
    validator: Arc<ContractValidator>,
    config: WorkerConfig,
    shutdown: watch::Receiver<bool>,
}

impl<S, St, C> fmt::Debug for ProjectionWorker<S, St, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionWorker")
            .field("config", &self.config)
            .field("shutdown_requested", &*self.shutdown.borrow())
            .finish_non_exhaustive()
    }
}

impl<S, St, C> ProjectionWorker<S, St, C>
where
    S: StreamConsumer,
    St: ReadModelStore,
    C: Clock,
{
    /// Assemble a worker.
    pub const fn new(
        consumer: S,
        store: St,
        projection: BlockProjection<C>,
        validator: Arc<ContractValidator>,
        config: WorkerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            consumer,
            store,
            projection,
            validator,
            config,
            shutdown,
        }
    }

    /// Active configuration.
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Process the backlog and whatever is available now, then stop.
    ///
    /// # Errors
    ///
    /// See [`WorkerError`].
    pub async fn run_once(&mut self) -> Result<RunSummary, WorkerError> {
        let mut summary = self.start().await?;
        let batch = self.read_with_retry(ReadCursor::New, self.config.block).await?;
        summary.merge(self.process_batch(batch).await?);
        info!(?summary, "Bounded run finished");
        Ok(summary)
    }

    /// Process messages until shutdown is signalled.
    ///
    /// Shutdown is honoured between batches and while waiting for new
    /// entries; a batch that was read is always processed to the end.
    ///
    /// # Errors
    ///
    /// See [`WorkerError`].
    pub async fn run(&mut self) -> Result<RunSummary, WorkerError> {
        let mut summary = self.start().await?;

        while !self.shutdown_requested() {
            let mut shutdown = self.shutdown.clone();
            let block = self.config.block;
            let batch = tokio::select! {
                batch = read_retrying(&mut self.consumer, &self.config, ReadCursor::New, block) => batch?,
                () = wait_for_shutdown(&mut shutdown) => break,
            };
            summary.merge(self.process_batch(batch).await?);
        }

        info!(?summary, "Worker stopped");
        Ok(summary)
    }

    /// Backlog sweep plus the first read, common to both run modes.
    async fn start(&mut self) -> Result<RunSummary, WorkerError> {
        let mut summary = self.drain_backlog().await?;
        let batch = self
            .read_with_retry(ReadCursor::New, self.config.first_block)
            .await?;
        summary.merge(self.process_batch(batch).await?);
        Ok(summary)
    }

    /// Re-process entries delivered to this consumer but never acknowledged.
    ///
    /// # Errors
    ///
    /// See [`WorkerError`].
    pub async fn drain_backlog(&mut self) -> Result<RunSummary, WorkerError> {
        let mut summary = RunSummary::default();
        loop {
            let batch = self
                .read_with_retry(ReadCursor::Backlog, Duration::ZERO)
                .await?;
            if batch.is_empty() {
                break;
            }
            summary.merge(self.process_batch(batch).await?);
        }
        if summary.total() > 0 {
            info!(?summary, "Pending backlog drained");
        }
        Ok(summary)
    }

    async fn read_with_retry(
        &mut self,
        cursor: ReadCursor,
        block: Duration,
    ) -> Result<Vec<StreamMessage>, WorkerError> {
        read_retrying(&mut self.consumer, &self.config, cursor, block).await
    }

    async fn process_batch(
        &mut self,
        batch: Vec<StreamMessage>,
    ) -> Result<RunSummary, WorkerError> {
        let mut summary = RunSummary::default();
        for message in &batch {
            summary.record(&self.process_message(message).await?);
        }
        Ok(summary)
    }

    /// Process one entry and acknowledge it.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stream`] if the dead-letter write or the
    /// acknowledgement fails; the entry is then left pending.
    pub async fn process_message(
        &mut self,
        message: &StreamMessage,
    ) -> Result<MessageOutcome, WorkerError> {
        let started = Instant::now();
        let outcome = self.handle(message).await?;
        self.consumer.acknowledge(&message.id).await?;
        ProjectorMetrics::record_message(&outcome, started.elapsed());
        Ok(outcome)
    }

    async fn handle(&mut self, message: &StreamMessage) -> Result<MessageOutcome, WorkerError> {
        let Some(raw) = message
            .payload
            .as_deref()
            .filter(|payload| !payload.trim().is_empty())
        else {
            warn!(message_id = %message.id, "Stream entry without data, acknowledging");
            return Ok(MessageOutcome::Skipped);
        };

        let envelope: Value = match serde_json::from_str(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(message_id = %message.id, error = %e, "Invalid JSON");
                return self.dead_letter(raw, DeadLetterReason::Json, &e).await;
            }
        };

        let cloudevent_id = envelope
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();

        let event = match self
            .validator
            .validate(&envelope)
            .and_then(|()| CloudEvent::from_value(envelope))
        {
            Ok(event) => event,
            Err(e) => {
                error!(message_id = %message.id, %cloudevent_id, error = %e, "Contract violation");
                return self.dead_letter(raw, DeadLetterReason::Contract, &e).await;
            }
        };

        match self.project(&event).await {
            Ok(outcome) => {
                info!(message_id = %message.id, %cloudevent_id, ?outcome, "OK");
                Ok(outcome.into())
            }
            Err(e) => {
                let reason = DeadLetterReason::from(&e);
                error!(
                    message_id = %message.id,
                    %cloudevent_id,
                    %reason,
                    error = %e,
                    "Projection failed"
                );
                self.dead_letter(raw, reason, &e).await
            }
        }
    }

    /// Run the projection in its own transaction: committed on success,
    /// rolled back on any failure.
    async fn project(&self, event: &CloudEvent) -> Result<ProjectionOutcome, ProjectorError> {
        let mut tx = self.store.begin().await?;
        match self.projection.project(&mut tx, event).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn dead_letter(
        &mut self,
        raw: &str,
        reason: DeadLetterReason,
        error: &dyn fmt::Display,
    ) -> Result<MessageOutcome, WorkerError> {
        self.consumer
            .dead_letter(raw, &format!("{reason}:{error}"))
            .await?;
        Ok(MessageOutcome::DeadLettered { reason })
    }
}

async fn read_retrying<S: StreamConsumer>(
    consumer: &mut S,
    config: &WorkerConfig,
    cursor: ReadCursor,
    block: Duration,
) -> Result<Vec<StreamMessage>, WorkerError> {
    let policy = &config.read_retry;
    let mut attempt = 0;
    loop {
        match consumer.read(cursor, config.batch_size, block).await {
            Ok(batch) => {
                if attempt > 0 {
                    info!(attempt, %cursor, "Stream read succeeded after retry");
                }
                debug!(%cursor, count = batch.len(), "Batch read");
                return Ok(batch);
            }
            Err(e) => {
                ProjectorMetrics::record_read_error();
                if attempt >= policy.max_retries {
                    error!(attempt, %cursor, error = %e, "Stream read failed after max retries");
                    return Err(e.into());
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    %cursor,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Stream read failed, retrying..."
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Resolves once `true` is observed; never resolves if every sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
