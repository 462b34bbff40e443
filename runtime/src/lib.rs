//! # Distribution Projector Runtime
//!
//! The driving side of the projector.
//!
//! ## Core Components
//!
//! - **Worker**: [`worker::ProjectionWorker`] pulls batches from a
//!   [`StreamConsumer`](distribution_projector_core::StreamConsumer), validates
//!   each envelope, runs the projection in its own transaction and
//!   acknowledges or dead-letters the entry
//! - **Retry**: exponential backoff for stream reads and start-up connections
//! - **Metrics**: Prometheus counters and histograms for processed messages
//!
//! ## Example
//!
//! ```ignore
//! use distribution_projector_runtime::{ProjectionWorker, WorkerConfig};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let mut worker = ProjectionWorker::new(consumer, store, projection, validator, WorkerConfig::default(), shutdown_rx);
//!
//! // Bounded: backlog plus what is available now
//! let summary = worker.run_once().await?;
//! println!("{} projected, {} dead-lettered", summary.projected, summary.dead_lettered);
//! ```

/// Retry logic with exponential backoff
pub mod retry;

/// Prometheus metrics for observability
pub mod metrics;

/// Stream → validation → projection loop
pub mod worker;

pub use retry::{RetryPolicy, retry_with_backoff};
pub use worker::{
    DeadLetterReason, MessageOutcome, ProjectionWorker, RunSummary, WorkerConfig, WorkerError,
};
